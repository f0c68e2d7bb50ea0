//! Output formatting for CLI client commands.
//!
//! Human-readable tables and status lines on stdout. `resources --json`
//! prints the descriptors as a JSON array instead.

use std::fmt::Write as _;

use crate::ipc::protocol::ResourceDescriptor;

use super::ClientError;
use super::settings::ServerSettings;

/// Print property names, one per line.
pub fn print_names(names: &[String], empty: &str) {
    if names.is_empty() {
        println!("{empty}");
        return;
    }
    for name in names {
        println!("{name}");
    }
}

pub fn print_resolved(name: &str, value: Option<&str>) {
    match value {
        Some(value) => println!("{name}={value}"),
        None => println!("{name} is not resolvable"),
    }
}

/// Print live resources as a table, or as JSON.
pub fn print_resources(resources: &[ResourceDescriptor], json: bool) -> Result<(), ClientError> {
    if json {
        println!("{}", serde_json::to_string_pretty(resources)?);
    } else {
        print!("{}", resources_table(resources));
    }
    Ok(())
}

pub fn print_closed(scope: Option<&str>, closed: bool) {
    let target = match scope {
        Some(scope) => format!("scope {scope}"),
        None => "all scopes".to_string(),
    };
    if closed {
        println!("Closed resources in {target}");
    } else {
        println!("No resources in {target}");
    }
}

pub fn print_started(settings: &ServerSettings) {
    println!("Server running at {}", settings.uri());
}

pub fn print_stopped(stopped: bool) {
    if stopped {
        println!("Server stopped");
    } else {
        println!("No server running");
    }
}

fn resources_table(resources: &[ResourceDescriptor]) -> String {
    let mut out = String::new();
    if resources.is_empty() {
        out.push_str("No live resources\n");
        return out;
    }
    let _ = writeln!(out, "{:<24} {:<40} {:<16} SCOPE", "NAME", "IMAGE", "ID");
    let _ = writeln!(out, "{}", "-".repeat(90));
    for r in resources {
        let _ = writeln!(
            out,
            "{:<24} {:<40} {:<16} {}",
            r.name,
            r.image_name,
            short_id(&r.id),
            if r.scope.is_empty() { "-" } else { &r.scope },
        );
    }
    out
}

/// Container IDs are shown the way `docker ps` shows them.
fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
