//! Inject command implementation

use crate::cli::{GlobalArgs, InjectArgs};
use crate::coordinator::Options;
use crate::error::Result;
use crate::ui;

/// Run inject command
pub fn run(global: &GlobalArgs, args: InjectArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let options = Options {
        weak: args.weak,
        reload: !args.no_reload,
        ..Options::default()
    };
    let outcome = if args.persisted {
        coordinator.apply_persisted(&args.id, options)?
    } else {
        coordinator.apply(&args.id, &args.paths, options)?
    };
    ui::print_outcome(&outcome);
    Ok(())
}
