//! Command-line interface definitions for the `taster` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `taster` binary.
#[derive(Debug, Parser)]
#[command(
    name = "taster",
    about = "Boot an OpenStack image, test it for compliance and storage, then tear it down",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Taste one or more images, each in its own session.
    #[command(name = "taste", about = "Taste one or more images, each in its own session")]
    Taste(TasteCommand),
}

/// Arguments for the `taster taste` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct TasteCommand {
    /// Image names to taste, in order. An unknown image stops the run.
    #[arg(required = true, value_name = "IMAGE")]
    pub(crate) images: Vec<String>,
    /// Login user on the images (for example `ubuntu` or `centos`).
    #[arg(long, value_name = "USER")]
    pub(crate) ssh_user: String,
    /// Skip the compliance suite.
    #[arg(long)]
    pub(crate) skip_security: bool,
    /// Skip the volume attach and mount workflow.
    #[arg(long)]
    pub(crate) skip_volumes: bool,
    /// Snapshot an instance whose tests fail before destroying it.
    #[arg(long)]
    pub(crate) create_snapshot: bool,
    /// Override the directory session logs are written under.
    #[arg(long, value_name = "DIR")]
    pub(crate) log_dir: Option<String>,
}
