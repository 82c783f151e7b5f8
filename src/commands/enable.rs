//! Enable command implementation

use crate::cli::{EnableArgs, GlobalArgs};
use crate::coordinator::Options;
use crate::error::Result;
use crate::ui;

/// Run enable command
pub fn run(global: &GlobalArgs, args: EnableArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let options = Options {
        weak: args.weak,
        reload: !args.no_reload,
        ..Options::default()
    };
    let outcome = coordinator.enable(&args.id, &args.names, options)?;
    ui::print_outcome(&outcome);
    Ok(())
}
