use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::db::{Attachment, AttachmentStatus, Checkpoint, CheckpointKey, CheckpointStatus};
use crate::snowflake::Snowflake;

#[derive(Parser, Debug)]
#[command(name = "community-mirror")]
#[command(about = "Mirrors chat communities into a local store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml", global = true)]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    #[command(about = "Run a full sync of one or more communities")]
    Sync {
        #[arg(short = 'g', long = "community", help = "Community ID (repeatable, defaults to config)")]
        communities: Vec<Snowflake>,
    },

    #[command(about = "Download queued attachments until interrupted")]
    Worker,

    #[command(about = "Reconcile attachment storage with the database")]
    Cleanup {
        #[arg(short, long, help = "Report without deleting anything")]
        dry_run: bool,
    },

    #[command(about = "Apply live upstream events from JSON lines")]
    Ingest {
        #[arg(short, long, help = "Event file, stdin when omitted")]
        input: Option<PathBuf>,
    },

    #[command(about = "Show unfinished checkpoints and attachment counts")]
    Status,

    #[command(about = "Pause syncing of a community or channel")]
    Pause {
        #[arg(short, long, value_enum)]
        entity: EntityArg,

        #[arg(long)]
        id: Snowflake,
    },

    #[command(about = "Resume a paused community or channel")]
    Resume {
        #[arg(short, long, value_enum)]
        entity: EntityArg,

        #[arg(long)]
        id: Snowflake,
    },

    #[command(about = "Validate the configuration file")]
    ValidateConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityArg {
    Community,
    Channel,
}

impl EntityArg {
    pub fn key(self, id: Snowflake) -> CheckpointKey {
        match self {
            EntityArg::Community => CheckpointKey::community(id),
            EntityArg::Channel => CheckpointKey::channel(id),
        }
    }
}

/// Plain-text summary of everything that is not in a finished state.
pub fn render_status(
    checkpoints: &[Checkpoint],
    attachments: &[(AttachmentStatus, i64)],
    problems: &[Attachment],
) -> String {
    let mut out = String::new();

    let open: Vec<&Checkpoint> = checkpoints
        .iter()
        .filter(|checkpoint| checkpoint.status != CheckpointStatus::Completed)
        .collect();
    if open.is_empty() {
        out.push_str("all checkpoints completed\n");
    } else {
        out.push_str("checkpoints:\n");
        for checkpoint in open {
            let _ = write!(out, "  {} {}", checkpoint.key, checkpoint.status);
            if let Some(cursor) = checkpoint.cursor {
                let _ = write!(out, " cursor={cursor}");
            }
            if let Some(error) = &checkpoint.error {
                let _ = write!(out, " error={error:?}");
            }
            out.push('\n');
        }
    }

    out.push_str("attachments:\n");
    if attachments.is_empty() {
        out.push_str("  none\n");
    }
    for (status, count) in attachments {
        let _ = writeln!(out, "  {status}: {count}");
    }

    if !problems.is_empty() {
        out.push_str("attachment problems:\n");
        for attachment in problems {
            let _ = write!(out, "  {} {} {}", attachment.id, attachment.status, attachment.filename);
            if let Some(reason) = attachment.last_error.as_ref().or(attachment.skip_reason.as_ref()) {
                let _ = write!(out, " reason={reason:?}");
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_accepts_repeated_communities() {
        let cli = Cli::try_parse_from(["community-mirror", "sync", "-g", "1", "--community", "2"])
            .unwrap();
        assert_eq!(
            cli.command,
            Some(Commands::Sync {
                communities: vec![Snowflake::new(1), Snowflake::new(2)],
            })
        );
    }

    #[test]
    fn pause_requires_a_numeric_id() {
        assert!(
            Cli::try_parse_from(["community-mirror", "pause", "--entity", "channel", "--id", "abc"])
                .is_err()
        );
        let cli = Cli::try_parse_from([
            "community-mirror",
            "--config",
            "other.yaml",
            "resume",
            "--entity",
            "channel",
            "--id",
            "9",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        let Some(Commands::Resume { entity, id }) = cli.command else {
            panic!("expected resume");
        };
        assert_eq!(entity.key(id), CheckpointKey::channel(Snowflake::new(9)));
    }

    #[test]
    fn status_lists_only_unfinished_checkpoints() {
        let mut failed = Checkpoint::new(CheckpointKey::channel(Snowflake::new(5)));
        failed.fail("access denied".to_string());
        let mut done = Checkpoint::new(CheckpointKey::channel(Snowflake::new(6)));
        done.complete(Some(Snowflake::new(60)));

        let text = render_status(&[failed, done], &[(AttachmentStatus::Failed, 3)], &[]);
        assert!(text.contains("channel 5 failed error=\"access denied\""));
        assert!(!text.contains("channel 6"));
        assert!(text.contains("failed: 3"));
        assert!(!text.contains("attachment problems"));
    }

    #[test]
    fn status_names_failed_attachments() {
        let mut broken = Attachment::new(
            Snowflake::new(7),
            Snowflake::new(100),
            "file-7.png".to_string(),
            "https://cdn.test/7/file-7.png".to_string(),
        );
        broken.mark_failed("status 404".to_string(), false);

        let text = render_status(&[], &[(AttachmentStatus::Failed, 1)], &[broken]);
        assert!(text.contains("attachment problems:"));
        assert!(text.contains("7 failed file-7.png reason=\"status 404\""));
    }
}
