//! Disable command implementation

use crate::cli::{DisableArgs, GlobalArgs};
use crate::coordinator::Options;
use crate::error::Result;
use crate::ui;

/// Run disable command
pub fn run(global: &GlobalArgs, args: DisableArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let options = Options {
        reload: !args.no_reload,
        ..Options::default()
    };
    let outcome = coordinator.disable(&args.id, &args.names, options)?;
    ui::print_outcome(&outcome);
    Ok(())
}
