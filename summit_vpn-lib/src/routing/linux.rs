//! Route argv rendering for the Linux `ip` command.

use std::path::Path;

use crate::platform::IP_TOOL;

use super::{Dest, Family, Gateway, Route};

pub(crate) fn tool() -> &'static Path {
    Path::new(IP_TOOL)
}

fn dest_string(route: &Route) -> String {
    match &route.dest {
        Dest::Default => "default".into(),
        Dest::Cidr(cidr) => cidr.clone(),
        Dest::Host(ip) => match route.family {
            Family::V4 => format!("{ip}/32"),
            Family::V6 => format!("{ip}/128"),
        },
    }
}

fn base(route: &Route, verb: &str) -> Vec<String> {
    let mut args = Vec::new();
    if route.family == Family::V6 {
        args.push("-6".into());
    }
    args.push("route".into());
    args.push(verb.into());
    args.push(dest_string(route));
    args
}

pub(crate) fn add(route: &Route) -> Vec<String> {
    let mut args = base(route, "add");
    match &route.gateway {
        Gateway::Via(gw) => {
            args.push("via".into());
            args.push(gw.to_string());
        }
        Gateway::ViaScoped(gw, iface) => {
            args.push("via".into());
            args.push(gw.to_string());
            args.push("dev".into());
            args.push(iface.clone());
            // keep below the plain default so both can coexist
            args.push("metric".into());
            args.push("50".into());
        }
    }
    args
}

pub(crate) fn delete(route: &Route) -> Vec<String> {
    let mut args = base(route, "del");
    if let Gateway::ViaScoped(_, iface) = &route.gateway {
        args.push("dev".into());
        args.push(iface.clone());
    }
    args
}
