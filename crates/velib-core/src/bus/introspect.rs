//! Introspection descriptors and their XML rendering.

use crate::config::BusConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

const DOCTYPE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

/// A method or signal argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arg {
    pub name: String,
    /// D-Bus type signature, e.g. `v` or `a{sv}`.
    pub signature: String,
    pub direction: Direction,
}

impl Arg {
    pub fn input(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            direction: Direction::In,
        }
    }

    pub fn output(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            direction: Direction::Out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Method {
    pub fn new(name: &str, args: Vec<Arg>) -> Self {
        Self {
            name: name.to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    pub args: Vec<Arg>,
}

impl SignalSpec {
    pub fn new(name: &str, args: Vec<Arg>) -> Self {
        Self {
            name: name.to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Method>,
    pub signals: Vec<SignalSpec>,
}

/// Introspection data for one object path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub interfaces: Vec<Interface>,
}

impl Node {
    /// A node exposing a single interface.
    pub fn for_interface(interface: Interface) -> Self {
        Self {
            interfaces: vec![interface],
        }
    }

    /// Render the node as an introspection XML document.
    ///
    /// `children` are the names of child nodes one level below this path.
    pub fn to_xml(&self, children: &[String]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", DOCTYPE);
        out.push_str("<node>\n");

        let introspectable = Interface {
            name: BusConfig::INTROSPECTABLE_INTERFACE.to_string(),
            methods: vec![Method::new(
                BusConfig::INTROSPECT,
                vec![Arg::output("xml_data", "s")],
            )],
            signals: Vec::new(),
        };

        for iface in self.interfaces.iter().chain(std::iter::once(&introspectable)) {
            let _ = writeln!(out, "  <interface name=\"{}\">", iface.name);
            for method in &iface.methods {
                write_member(&mut out, "method", &method.name, &method.args, true);
            }
            for signal in &iface.signals {
                write_member(&mut out, "signal", &signal.name, &signal.args, false);
            }
            out.push_str("  </interface>\n");
        }

        for child in children {
            let _ = writeln!(out, "  <node name=\"{}\"/>", child);
        }

        out.push_str("</node>\n");
        out
    }
}

fn write_member(out: &mut String, tag: &str, name: &str, args: &[Arg], with_direction: bool) {
    if args.is_empty() {
        let _ = writeln!(out, "    <{} name=\"{}\"/>", tag, name);
        return;
    }

    let _ = writeln!(out, "    <{} name=\"{}\">", tag, name);
    for arg in args {
        if with_direction {
            let direction = match arg.direction {
                Direction::In => "in",
                Direction::Out => "out",
            };
            let _ = writeln!(
                out,
                "      <arg name=\"{}\" type=\"{}\" direction=\"{}\"/>",
                arg.name, arg.signature, direction
            );
        } else {
            let _ = writeln!(
                out,
                "      <arg name=\"{}\" type=\"{}\"/>",
                arg.name, arg.signature
            );
        }
    }
    let _ = writeln!(out, "    </{}>", tag);
}
