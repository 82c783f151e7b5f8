//! Terminal rendering of applications, attachments and operation results
//!
//! Everything user-facing goes to stdout through `console::Style`; diagnostics
//! go through `log` and never end up here.

use std::path::PathBuf;

use console::Style;
use goblin::mach::cputype::{
    CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86, CPU_TYPE_X86_64, CpuType,
};

use crate::coordinator::Outcome;
use crate::directory::{ApplicationSummary, ApplicationType};
use crate::inspector::{Eligibility, Inspection};
use crate::store::Attachment;

fn label(text: &str) -> console::StyledObject<&str> {
    Style::new().bold().apply_to(text)
}

/// Short architecture name of a slice
pub fn arch_name(cputype: CpuType) -> String {
    match cputype {
        CPU_TYPE_ARM64 => "arm64".to_string(),
        CPU_TYPE_ARM64_32 => "arm64_32".to_string(),
        CPU_TYPE_ARM => "armv7".to_string(),
        CPU_TYPE_X86_64 => "x86_64".to_string(),
        CPU_TYPE_X86 => "i386".to_string(),
        other => format!("cpu {other:#x}"),
    }
}

fn kind_name(kind: ApplicationType) -> &'static str {
    match kind {
        ApplicationType::User => "user",
        ApplicationType::System => "system",
    }
}

/// One line per application: identifier, name, version and kind
pub fn print_applications(apps: &[ApplicationSummary]) {
    if apps.is_empty() {
        println!("No applications found.");
        return;
    }
    println!("Applications ({}):", apps.len());
    println!();
    let width = apps.iter().map(|a| a.id.len()).max().unwrap_or(0);
    for app in apps {
        println!(
            "  {:<width$}  {} {}  {}",
            Style::new().bold().yellow().apply_to(&app.id),
            app.name,
            Style::new().dim().apply_to(app.version.as_deref().unwrap_or("-")),
            Style::new().cyan().apply_to(kind_name(app.kind)),
        );
    }
}

pub fn print_attachments(attachments: &[Attachment]) {
    if attachments.is_empty() {
        println!("  (none)");
        return;
    }
    for attachment in attachments {
        let state = if attachment.enabled { "" } else { " [disabled]" };
        println!(
            "  {} {}{}",
            Style::new().bold().yellow().apply_to(&attachment.name),
            Style::new().dim().apply_to(format!("[{}]", attachment.kind)),
            Style::new().red().apply_to(state),
        );
        println!("    {} {}", label("Path:"), attachment.relative_path.display());
        if let Some(reference) = &attachment.reference {
            println!("    {} {reference}", label("Load command:"));
        }
        println!("    {} {}", label("Hash:"), attachment.content_hash);
    }
}

/// Full description of one application for `view`
pub fn print_inspection(inspection: &Inspection) {
    let record = &inspection.record;
    println!("{}", Style::new().bold().yellow().apply_to(&record.name));
    println!("  {} {}", label("Identifier:"), record.id);
    if let Some(version) = &record.version {
        println!("  {} {version}", label("Version:"));
    }
    println!("  {} {}", label("Type:"), kind_name(record.kind));
    println!("  {} {}", label("Bundle:"), record.bundle_root.display());
    println!("  {} {}", label("Executable:"), record.executable.display());
    if let Some(data) = &record.containers.data {
        println!("  {} {}", label("Data container:"), data.display());
    }
    for (group, path) in &record.containers.groups {
        println!("  {} {group} → {}", label("Group container:"), path.display());
    }
    for plugin in &record.plugins {
        println!("  {} {}", label("Plug-in:"), plugin.id);
    }
    if !record.entitlements.is_empty() {
        let keys: Vec<&str> = record.entitlements.keys().map(String::as_str).collect();
        println!("  {} {}", label("Entitlements:"), keys.join(", "));
    }

    let arches: Vec<String> = inspection.slices.iter().map(|s| arch_name(s.cputype)).collect();
    if !arches.is_empty() {
        println!("  {} {}", label("Architectures:"), arches.join(", "));
    }
    if let Some(slice) = inspection.slices.iter().min_by_key(|s| s.free_space) {
        println!("  {} {} bytes", label("Header space:"), slice.free_space);
    }
    match &inspection.eligibility {
        Eligibility::Eligible => println!("  {} yes", label("Eligible:")),
        Eligibility::Ineligible(reason) => println!(
            "  {} {}",
            label("Eligible:"),
            Style::new().red().apply_to(format!("no ({reason})"))
        ),
    }

    println!();
    println!("{}", label("Attached modules:"));
    print_attachments(&inspection.manifest.attachments);
    print_divergences(inspection);
}

/// Persisted module copies, as listed by `view`
pub fn print_persisted(paths: &[PathBuf]) {
    println!();
    println!("{}", label("Persisted modules:"));
    if paths.is_empty() {
        println!("  (none)");
        return;
    }
    for path in paths {
        let name = path.file_name().unwrap_or(path.as_os_str());
        println!("  {}", name.to_string_lossy());
    }
}

/// Verification result for `verify`
pub fn print_verification(inspection: &Inspection) {
    if inspection.is_consistent() {
        println!(
            "{} {} ({} module(s) attached)",
            Style::new().green().bold().apply_to("✔"),
            inspection.record.id,
            inspection.manifest.attachments.len()
        );
    } else {
        print_divergences(inspection);
    }
}

fn print_divergences(inspection: &Inspection) {
    if inspection.divergences.is_empty() {
        return;
    }
    println!();
    println!(
        "{}",
        Style::new().red().bold().apply_to("Inconsistencies:")
    );
    for divergence in &inspection.divergences {
        println!("  - {divergence}");
    }
}

/// Summary of a committed apply or remove
pub fn print_outcome(outcome: &Outcome) {
    let ok = Style::new().green().bold();
    for attachment in &outcome.attached {
        println!(
            "{} Injected {} into {}",
            ok.apply_to("✔"),
            attachment.name,
            outcome.application.id
        );
    }
    for attachment in &outcome.detached {
        println!(
            "{} Ejected {} from {}",
            ok.apply_to("✔"),
            attachment.name,
            outcome.application.id
        );
    }
    for attachment in &outcome.enabled {
        println!(
            "{} Enabled {} in {}",
            ok.apply_to("✔"),
            attachment.name,
            outcome.application.id
        );
    }
    for attachment in &outcome.disabled {
        println!(
            "{} Disabled {} in {}",
            ok.apply_to("✔"),
            attachment.name,
            outcome.application.id
        );
    }
    let changes = outcome.attached.len()
        + outcome.detached.len()
        + outcome.enabled.len()
        + outcome.disabled.len();
    if changes == 0 {
        println!("Nothing to do for {}.", outcome.application.id);
    }
    if let Some(report) = &outcome.reload {
        for process in &report.terminated {
            println!("  Terminated {} ({})", process.name, process.pid);
        }
    }
    for warning in &outcome.warnings {
        println!("{} {warning}", Style::new().yellow().bold().apply_to("warning:"));
    }
}
