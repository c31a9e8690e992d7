//! Route argv rendering for the BSD `route` command (macOS).

use std::path::Path;

use crate::platform::ROUTE_TOOL;

use super::{Dest, Family, Gateway, Route};

pub(crate) fn tool() -> &'static Path {
    Path::new(ROUTE_TOOL)
}

fn family_flag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-inet",
        Family::V6 => "-inet6",
    }
}

fn push_dest(args: &mut Vec<String>, dest: &Dest) {
    match dest {
        Dest::Default => args.push("default".into()),
        Dest::Cidr(cidr) => args.push(cidr.clone()),
        Dest::Host(ip) => {
            args.push("-host".into());
            args.push(ip.to_string());
        }
    }
}

pub(crate) fn add(route: &Route) -> Vec<String> {
    let mut args = vec!["-n".into(), "add".into(), family_flag(route.family).into()];
    push_dest(&mut args, &route.dest);
    match &route.gateway {
        Gateway::Via(gw) => args.push(gw.to_string()),
        Gateway::ViaScoped(gw, iface) => {
            args.push(gw.to_string());
            args.push("-ifscope".into());
            args.push(iface.clone());
        }
    }
    args
}

pub(crate) fn delete(route: &Route) -> Vec<String> {
    let mut args = vec!["-n".into(), "delete".into(), family_flag(route.family).into()];
    push_dest(&mut args, &route.dest);
    if let Gateway::ViaScoped(_, iface) = &route.gateway {
        args.push("-ifscope".into());
        args.push(iface.clone());
    }
    args
}
