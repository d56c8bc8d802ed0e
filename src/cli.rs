/// CLI argument parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "volback")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control daemon
    Control,

    /// Trigger a backup and stream its logs
    Backup,

    /// Restore the most recent coherent backup set and stream its logs
    Restore,

    /// Cancel the in-flight backup or restore
    Cancel,

    /// Probe the control daemon; exits non-zero unless the check passes
    Healthcheck,

    /// Runner entry point for backup stage 2 (launched by the daemon)
    #[command(name = "backup-stage2", hide = true)]
    BackupStage2 {
        /// JSON job payload
        job: String,
    },

    /// Runner entry point for restore stage 2 (launched by the daemon)
    #[command(name = "restore-stage2", hide = true)]
    RestoreStage2 {
        /// JSON job payload
        job: String,
    },
}
