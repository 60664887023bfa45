//! Output formatting for scan results

use anyhow::Result;
use lynx_common::{service_name, DiscoveryMethod, HostRecord, PrivilegeReport, ScanSummary};
use std::fmt::Write as _;
use std::time::Duration;

/// Print the final host set in the specified format
pub fn print_results(summary: &ScanSummary, format: &str) -> Result<()> {
    let format = format.trim().to_lowercase();
    match format.as_str() {
        "json" | "j" => println!("{}", render_json(summary)?),
        "csv" | "c" => print!("{}", render_csv(summary)),
        "table" | "text" | "t" | "" => print!("{}", render_table(summary)),
        _ => {
            eprintln!("Warning: Unknown format '{}', using default table format", format);
            print!("{}", render_table(summary));
        }
    }
    Ok(())
}

/// One line per host as it streams in, on stderr so stdout stays parseable.
pub fn print_host_line(host: &HostRecord) {
    eprintln!("  + {:<40} {}", host.address, method_list(host));
}

pub fn print_methods(methods: &[DiscoveryMethod]) {
    println!("{:<14} {:<14} {}", "METHOD", "LABEL", "PRIVILEGE");
    for method in methods {
        println!(
            "{:<14} {:<14} {}",
            method.as_str(),
            method.label(),
            if method.requires_privilege() { "required" } else { "-" }
        );
    }
}

pub fn print_privilege(report: &PrivilegeReport) {
    match &report.reason {
        Some(reason) => println!("{} ({})", report.state, reason),
        None => println!("{}", report.state),
    }
}

fn render_table(summary: &ScanSummary) -> String {
    let mut out = String::new();
    if summary.hosts.is_empty() {
        out.push_str("\nNo hosts found.\n\n");
    } else {
        let _ = writeln!(out, "\n{:-<100}", "");
        let _ = writeln!(
            out,
            "{:<40} {:<18} {:<10} {:<30}",
            "HOST", "MAC", "LATENCY", "METHODS / PORTS"
        );
        let _ = writeln!(out, "{:-<100}", "");
        for host in &summary.hosts {
            let mut evidence = method_list(host);
            if !host.open_ports.is_empty() {
                let _ = write!(evidence, " / {}", port_list(host));
            }
            let _ = writeln!(
                out,
                "{:<40} {:<18} {:<10} {}",
                host.address.to_string(),
                host.mac.as_deref().unwrap_or("-"),
                host.latency()
                    .map(format_duration)
                    .unwrap_or_else(|| "-".to_string()),
                evidence
            );
            if let Some(hostname) = &host.hostname {
                let _ = writeln!(out, "  {}", hostname);
            }
        }
        let _ = writeln!(out, "{:-<100}", "");
    }

    let _ = writeln!(out, "\nSummary:");
    let _ = writeln!(out, "  State: {}", summary.state);
    let _ = writeln!(out, "  Hosts found: {}", summary.hosts_found);
    for (method, count) in &summary.per_method {
        let _ = writeln!(out, "    {}: {}", method, count);
    }
    if !summary.methods_skipped.is_empty() {
        let skipped: Vec<&str> = summary.methods_skipped.iter().map(|m| m.label()).collect();
        let _ = writeln!(out, "  Skipped (no privilege): {}", skipped.join(", "));
    }
    for failure in &summary.failures {
        let _ = writeln!(out, "  Failed {}: {}", failure.method, failure.reason);
    }
    if summary.timed_out {
        let _ = writeln!(out, "  Global timeout reached");
    }
    let _ = writeln!(
        out,
        "  Duration: {}",
        format_duration(Duration::from_millis(summary.elapsed_ms))
    );
    out.push('\n');
    out
}

fn render_json(summary: &ScanSummary) -> Result<String> {
    use serde_json::json;

    let output = json!({
        "scan_info": {
            "operation_id": summary.operation_id,
            "state": summary.state,
            "duration_seconds": summary.elapsed_ms as f64 / 1000.0,
            "duration_formatted": format_duration(Duration::from_millis(summary.elapsed_ms)),
            "hosts_found": summary.hosts_found,
            "per_method": summary.per_method,
            "methods_attempted": summary.methods_attempted,
            "methods_skipped": summary.methods_skipped,
            "failures": summary.failures,
            "timed_out": summary.timed_out
        },
        "hosts": summary.hosts
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

fn render_csv(summary: &ScanSummary) -> String {
    let mut out = String::from("address,mac,hostname,methods,open_ports,latency_us\n");
    for host in &summary.hosts {
        let hostname = host
            .hostname
            .as_ref()
            .map(|h| format!("\"{}\"", h.replace('"', "\"\"")))
            .unwrap_or_default();
        let methods: Vec<&str> = host.methods.iter().map(|m| m.as_str()).collect();
        let ports: Vec<String> = host.open_ports.iter().map(u16::to_string).collect();
        let _ = writeln!(
            out,
            "{},{},{},\"{}\",\"{}\",{}",
            host.address,
            host.mac.as_deref().unwrap_or(""),
            hostname,
            methods.join(";"),
            ports.join(";"),
            host.latency_us.map(|l| l.to_string()).unwrap_or_default()
        );
    }
    out
}

fn method_list(host: &HostRecord) -> String {
    host.methods
        .iter()
        .map(|m| m.label())
        .collect::<Vec<_>>()
        .join(",")
}

/// Open ports, each with its service name when it has a well-known one.
fn port_list(host: &HostRecord) -> String {
    host.open_ports
        .iter()
        .map(|&port| match service_name(port) {
            Some(service) => format!("{port}/{service}"),
            None => port.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Format duration in a human-readable way
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs == 0 {
        if millis == 0 {
            format!("{}us", duration.subsec_micros())
        } else {
            format!("{}ms", millis)
        }
    } else if total_secs < 60 {
        if millis > 0 {
            format!("{}.{:03}s", total_secs, millis)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}
