//! Eject command implementation

use console::Style;
use inquire::Confirm;

use crate::cli::{EjectArgs, GlobalArgs};
use crate::coordinator::Options;
use crate::error::Result;
use crate::store::Attachment;
use crate::ui;

/// Run eject command
pub fn run(global: &GlobalArgs, args: EjectArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let options = Options {
        reload: !args.no_reload,
        keep_persisted: args.keep_persisted,
        ..Options::default()
    };

    let outcome = if args.all {
        let attachments = coordinator.list_attachments(&args.id)?;
        if attachments.is_empty() {
            println!("No modules attached to {}.", args.id);
            return Ok(());
        }
        if !args.yes && !confirm_all(&args.id, &attachments)? {
            println!("Cancelled.");
            return Ok(());
        }
        coordinator.remove_all(&args.id, options)?
    } else {
        coordinator.remove(&args.id, &args.names, options)?
    };
    ui::print_outcome(&outcome);
    Ok(())
}

fn confirm_all(id: &str, attachments: &[Attachment]) -> Result<bool> {
    println!("\nThe following module(s) will be ejected from {id}:");
    for attachment in attachments {
        println!("  - {}", Style::new().yellow().apply_to(&attachment.name));
    }
    println!();

    let confirmed = Confirm::new("Proceed with eject?")
        .with_default(false)
        .with_help_message("Press 'y' to confirm, or Enter to cancel")
        .prompt()?;
    Ok(confirmed)
}
