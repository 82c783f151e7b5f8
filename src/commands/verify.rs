//! Verify command implementation

use crate::cli::{GlobalArgs, VerifyArgs};
use crate::error::{GraftError, Result};
use crate::ui;

/// Run verify command; inconsistencies make the command fail
pub fn run(global: &GlobalArgs, args: VerifyArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let inspection = coordinator.verify(&args.id)?;
    ui::print_verification(&inspection);
    if inspection.is_consistent() {
        return Ok(());
    }
    Err(GraftError::IntegrityMismatch {
        id: inspection.record.id.clone(),
        detail: format!("{} problem(s) found", inspection.divergences.len()),
    })
}
