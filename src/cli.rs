//! CLI definitions using clap derive API

use clap::builder::{Styles, styling::AnsiColor};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Graft - tweak injection manager
///
/// Inject dynamic libraries, frameworks and resource bundles into installed
/// applications, and take them out again.
#[derive(Parser, Debug)]
#[command(
    name = "graft",
    author,
    version,
    color = clap::ColorChoice::Auto,
    styles = Styles::styled()
        .header(AnsiColor::Green.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default().bold())
        .placeholder(AnsiColor::Cyan.on_default()),
    about = "Tweak injection manager for installed applications",
    long_about = "Graft adds load commands for tweak modules to an application's executable, \
                  stages the modules inside its bundle, and keeps a manifest so every change \
                  can be reverted. Each change is a transaction that rolls back on failure.",
    after_help = "\x1b[1m\x1b[32mExamples:\x1b[0m\n    \
                  graft list --user\n    \
                  graft view com.example.app\n    \
                  graft inject com.example.app -p ./Tweak.dylib\n    \
                  graft disable com.example.app -p Tweak.dylib\n    \
                  graft eject com.example.app --all -y\n    \
                  graft verify com.example.app"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Root of user application containers
    #[arg(long, global = true, env = "GRAFT_APPS_ROOT", value_name = "DIR")]
    pub apps_root: Option<PathBuf>,

    /// Root of system applications
    #[arg(long, global = true, env = "GRAFT_SYSTEM_APPS_ROOT", value_name = "DIR")]
    pub system_apps_root: Option<PathBuf>,

    /// Directory holding manifests, journals and locks
    #[arg(long, global = true, env = "GRAFT_STATE_DIR", value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Settings file (defaults to graft.yaml in the state directory)
    #[arg(long, global = true, env = "GRAFT_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List installed applications
    List(ListArgs),

    /// Show an application and its attached modules
    View(ViewArgs),

    /// Inject modules into an application
    Inject(InjectArgs),

    /// Remove injected modules from an application
    Eject(EjectArgs),

    /// Unlink attached modules without ejecting them
    Disable(DisableArgs),

    /// Link disabled modules again
    Enable(EnableArgs),

    /// Check an application's executable, manifest and staged modules
    Verify(VerifyArgs),

    /// Roll back interrupted transactions
    Recover,

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Show version information
    Version,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  List all applications:\n    graft list\n\n\
                  List user applications only:\n    graft list --user")]
pub struct ListArgs {
    /// Only user-installed applications
    #[arg(long)]
    pub user: bool,
}

/// Arguments for the view command
#[derive(Parser, Debug)]
pub struct ViewArgs {
    /// Bundle identifier
    pub id: String,
}

/// Arguments for the inject command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Inject a dylib:\n    graft inject com.example.app -p ./Tweak.dylib\n\n\
                  Inject several modules at once:\n    graft inject com.example.app -p A.dylib -p Kit.framework\n\n\
                  Use weak load commands and leave the app running:\n    \
                  graft inject com.example.app -p ./Tweak.dylib --weak --no-reload\n\n\
                  Inject the persisted modules again after an app update:\n    \
                  graft inject com.example.app --persisted")]
pub struct InjectArgs {
    /// Bundle identifier
    pub id: String,

    /// Module to inject (.dylib, .framework or .bundle)
    #[arg(
        long = "path",
        short = 'p',
        value_name = "PATH",
        num_args = 1..,
        required_unless_present = "persisted",
        conflicts_with = "persisted"
    )]
    pub paths: Vec<PathBuf>,

    /// Inject the copies persisted by earlier injections
    #[arg(long)]
    pub persisted: bool,

    /// Insert weak load commands
    #[arg(long)]
    pub weak: bool,

    /// Do not terminate running instances afterwards
    #[arg(long)]
    pub no_reload: bool,
}

/// Arguments for the eject command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Eject one module:\n    graft eject com.example.app -p Tweak.dylib\n\n\
                  Eject everything without confirmation:\n    graft eject com.example.app --all -y")]
pub struct EjectArgs {
    /// Bundle identifier
    pub id: String,

    /// Name of an attached module
    #[arg(
        long = "path",
        short = 'p',
        value_name = "NAME",
        num_args = 1..,
        required_unless_present = "all",
        conflicts_with = "all"
    )]
    pub names: Vec<String>,

    /// Eject every attached module
    #[arg(long)]
    pub all: bool,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Keep the persisted copies for a later `inject --persisted`
    #[arg(long)]
    pub keep_persisted: bool,

    /// Do not terminate running instances afterwards
    #[arg(long)]
    pub no_reload: bool,
}

/// Arguments for the disable command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Disable a module:\n    graft disable com.example.app -p Tweak.dylib")]
pub struct DisableArgs {
    /// Bundle identifier
    pub id: String,

    /// Name of an attached module
    #[arg(long = "path", short = 'p', value_name = "NAME", required = true, num_args = 1..)]
    pub names: Vec<String>,

    /// Do not terminate running instances afterwards
    #[arg(long)]
    pub no_reload: bool,
}

/// Arguments for the enable command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Enable a disabled module:\n    graft enable com.example.app -p Tweak.dylib")]
pub struct EnableArgs {
    /// Bundle identifier
    pub id: String,

    /// Name of a disabled module
    #[arg(long = "path", short = 'p', value_name = "NAME", required = true, num_args = 1..)]
    pub names: Vec<String>,

    /// Insert weak load commands
    #[arg(long)]
    pub weak: bool,

    /// Do not terminate running instances afterwards
    #[arg(long)]
    pub no_reload: bool,
}

/// Arguments for the verify command
#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Bundle identifier
    pub id: String,
}

/// Arguments for completions command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Generate bash completions:\n    graft completions --shell bash > ~/.bash_completion.d/graft\n\n\
                  Generate zsh completions:\n    graft completions --shell zsh > ~/.zfunc/_graft")]
pub struct CompletionsArgs {
    /// Shell type (bash, elvish, fish, powershell, zsh)
    #[arg(long)]
    pub shell: String,
}
