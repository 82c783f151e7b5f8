//! Recover command implementation

use console::Style;

use crate::cli::GlobalArgs;
use crate::error::Result;

/// Run recover command
///
/// Opening the coordinator already rolls back abandoned journals; this
/// reports what was found and sweeps once more. Journals that still cannot
/// be rolled back are listed and the first failure is returned.
pub fn run(global: &GlobalArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let mut recovered = coordinator.recovered_on_start().to_vec();
    let sweep = coordinator.recover()?;
    recovered.extend(sweep.recovered);

    if recovered.is_empty() && sweep.failed.is_empty() {
        println!("No interrupted transactions.");
        return Ok(());
    }
    for id in &recovered {
        println!("{} Rolled back {id}", Style::new().green().bold().apply_to("✔"));
    }
    for (id, err) in &sweep.failed {
        eprintln!("{} Could not roll back {id}: {err}", Style::new().red().bold().apply_to("✘"));
    }
    match sweep.failed.into_iter().next() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}
