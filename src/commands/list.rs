//! List command implementation

use crate::cli::{GlobalArgs, ListArgs};
use crate::directory::ApplicationType;
use crate::error::Result;
use crate::ui;

/// Run list command
pub fn run(global: &GlobalArgs, args: ListArgs) -> Result<()> {
    let coordinator = super::context::coordinator(global)?;
    let mut apps = coordinator.list_applications()?;
    if args.user {
        apps.retain(|app| app.kind == ApplicationType::User);
    }
    ui::print_applications(&apps);
    Ok(())
}
