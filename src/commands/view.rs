//! View command implementation

use crate::cli::{GlobalArgs, ViewArgs};
use crate::error::Result;
use crate::ui;

/// Run view command
pub fn run(global: &GlobalArgs, args: ViewArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let inspection = coordinator.describe(&args.id)?;
    ui::print_inspection(&inspection);
    ui::print_persisted(&coordinator.persisted_assets(&inspection.record.id)?);
    Ok(())
}
