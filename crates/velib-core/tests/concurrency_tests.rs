//! Locking behaviour of published paths under concurrent callers.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use velib_core::bus::{Node, ReleaseNameReply, RequestNameReply};
use velib_core::{
    BusConnection, BusObject, MemoryBus, MemoryConnection, PathValue, Result, Service, Value,
    ValueHolder, VelibError,
};

fn service(bus: &MemoryBus) -> Service {
    Service::new(bus.connect().unwrap(), "com.victronenergy.battery.ttyO1").unwrap()
}

/// Blocks any set of `"block"` until released.
struct Gate {
    value: Value,
    entered: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ValueHolder for Gate {
    fn value(&self) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn text(&self) -> Result<String> {
        Ok(self.value.to_string())
    }

    fn set_value(&mut self, value: Value) -> Result<()> {
        if value == json!("block") {
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.value = value;
        Ok(())
    }
}

#[test]
fn test_different_paths_do_not_block_each_other() {
    let bus = MemoryBus::new();
    let service = service(&bus);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let slow = service
        .add_path(
            "/Slow",
            PathValue::custom(Gate {
                value: json!(0),
                entered: entered_tx,
                release: Mutex::new(release_rx),
            }),
        )
        .unwrap();
    let fast = service.add_path("/Fast", 0).unwrap();

    let blocked = thread::spawn(move || slow.set_value("block"));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The slow set is parked inside its holder; other paths and the table
    // stay usable.
    fast.set_value(1).unwrap();
    assert_eq!(fast.value().unwrap(), json!(1));
    service.add_path("/Late", true).unwrap();

    release_tx.send(()).unwrap();
    blocked.join().unwrap().unwrap();
    assert_eq!(
        service.item("/Slow").unwrap().unwrap().value().unwrap(),
        json!("block")
    );
}

/// Counts sets that overlap in time.
struct Overlap {
    value: Value,
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
}

impl ValueHolder for Overlap {
    fn value(&self) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn text(&self) -> Result<String> {
        Ok(self.value.to_string())
    }

    fn set_value(&mut self, value: Value) -> Result<()> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_micros(200));
        self.value = value;
        self.busy.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_same_path_sets_are_serialized() {
    const THREADS: usize = 8;
    const SETS: usize = 25;

    let bus = MemoryBus::new();
    let service = service(&bus);
    let overlaps = Arc::new(AtomicUsize::new(0));
    let item = service
        .add_path(
            "/Shared",
            PathValue::custom(Overlap {
                value: json!(0),
                busy: Arc::new(AtomicBool::new(false)),
                overlaps: overlaps.clone(),
            }),
        )
        .unwrap();

    let mut rx = bus.subscribe();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let item = item.clone();
            thread::spawn(move || {
                for i in 0..SETS {
                    item.set_value(json!(t * 1000 + i)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    // One signal per set, each carrying a value and its matching text.
    let mut seen = 0;
    while let Ok(signal) = rx.try_recv() {
        assert_eq!(signal.path, "/Shared");
        assert_eq!(
            signal.payload["Text"],
            json!(signal.payload["Value"].to_string())
        );
        seen += 1;
    }
    assert_eq!(seen, THREADS * SETS);
}

#[test]
fn test_listing_while_registering() {
    let bus = MemoryBus::new();
    let service = service(&bus);
    service.add_path("/Base", 1).unwrap();

    let writer = {
        let service = service.clone();
        thread::spawn(move || {
            for i in 0..50 {
                service.add_path(&format!("/Extra/{}", i), i).unwrap();
            }
        })
    };

    for _ in 0..50 {
        let items = service.list_items().unwrap();
        assert!(items.contains_key("/Base"));
    }
    writer.join().unwrap();

    assert_eq!(service.list_items().unwrap().len(), 51);
}

/// Parks the export of `/Slow` until released; delegates everything else.
struct SlowExport {
    inner: Arc<MemoryConnection>,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl BusConnection for SlowExport {
    fn unique_name(&self) -> &str {
        self.inner.unique_name()
    }

    fn export(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()> {
        if path == "/Slow" {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.export(path, object)
    }

    fn export_subtree(&self, path: &str, object: Arc<dyn BusObject>) -> Result<()> {
        self.inner.export_subtree(path, object)
    }

    fn export_introspection(&self, path: &str, node: Node) -> Result<()> {
        self.inner.export_introspection(path, node)
    }

    fn unexport(&self, path: &str) -> Result<()> {
        self.inner.unexport(path)
    }

    fn emit(&self, path: &str, interface: &str, member: &str, payload: Value) -> Result<()> {
        self.inner.emit(path, interface, member, payload)
    }

    fn request_name(&self, name: &str) -> Result<RequestNameReply> {
        self.inner.request_name(name)
    }

    fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        self.inner.release_name(name)
    }

    fn call(&self, destination: &str, path: &str, member: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.call(destination, path, member, args)
    }
}

#[test]
fn test_slow_export_does_not_block_the_table() {
    let bus = MemoryBus::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let conn = Arc::new(SlowExport {
        inner: bus.connect().unwrap(),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let service = Service::new(conn, "com.victronenergy.battery.ttyO1").unwrap();
    service.add_path("/Fast", 1).unwrap();

    let adding = {
        let service = service.clone();
        thread::spawn(move || service.add_path("/Slow", 2).map(|_| ()))
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // The export of /Slow is in flight: listing and other paths proceed, and
    // the path is already claimed.
    let items = service.list_items().unwrap();
    assert_eq!(items.keys().collect::<Vec<_>>(), vec!["/Fast"]);
    service.add_path("/Other", 3).unwrap();
    assert!(matches!(
        service.add_path("/Slow", 4),
        Err(VelibError::DuplicatePath { .. })
    ));

    release_tx.send(()).unwrap();
    adding.join().unwrap().unwrap();
    assert_eq!(service.list_items().unwrap().len(), 3);
    assert_eq!(
        service.item("/Slow").unwrap().unwrap().value().unwrap(),
        json!(2)
    );
}
