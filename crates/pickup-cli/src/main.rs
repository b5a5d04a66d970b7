use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.smartpickup.Pickup1",
    default_service = "org.smartpickup.Pickup1",
    default_path = "/org/smartpickup/Pickup1"
)]
trait Pickup {
    async fn status(&self) -> zbus::Result<String>;
    async fn set_mode(&self, mode: &str) -> zbus::Result<()>;
    async fn current_detection(&self) -> zbus::Result<String>;
    async fn current_recognition(&self) -> zbus::Result<String>;
    async fn register_held(&self, name: &str, role: &str) -> zbus::Result<String>;
    async fn recapture_held(&self, guardian_id: &str) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, role: &str, descriptor: Vec<f64>) -> zbus::Result<String>;
    async fn update_guardian(&self, id: &str, name: &str, role: &str) -> zbus::Result<String>;
    async fn enroll_child(&self, name: &str, class: &str, section: &str) -> zbus::Result<String>;
    async fn link(&self, parent_id: &str, child_ids: Vec<String>, replace: bool) -> zbus::Result<String>;
    async fn recognize(&self, descriptor: Vec<f64>) -> zbus::Result<String>;
    async fn delete(&self, kind: &str, id: &str) -> zbus::Result<bool>;
    async fn list(&self, kind: &str) -> zbus::Result<String>;
    async fn confirm_pickup(&self, guardian_id: &str, child_id: &str) -> zbus::Result<String>;
    async fn clear_audit(&self) -> zbus::Result<u64>;
    async fn export(&self) -> zbus::Result<String>;
    async fn import(&self, snapshot: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "pickup", about = "Smart pickup kiosk CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Switch kiosk mode (idle, registration, recognition)
    Mode { mode: String },
    /// Register a guardian from the face currently held on camera
    Register {
        #[arg(short, long)]
        name: String,
        /// father, mother, guardian or other
        #[arg(short, long, default_value = "guardian")]
        role: String,
        /// Enroll from a JSON descriptor file ("-" for stdin) instead of the camera
        #[arg(long)]
        descriptor: Option<PathBuf>,
    },
    /// Replace a guardian's face with the one currently held on camera
    Recapture { guardian_id: String },
    /// Rename a guardian or change its role
    Edit {
        guardian_id: String,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        role: Option<String>,
    },
    /// Enroll a child
    EnrollChild {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        class: String,
        #[arg(short, long)]
        section: String,
    },
    /// Link children to a guardian
    Link {
        guardian_id: String,
        #[arg(required = true)]
        child_ids: Vec<String>,
        /// Replace the guardian's links instead of adding to them
        #[arg(long)]
        replace: bool,
    },
    /// List records (guardians, children, links, audit)
    List { kind: String },
    /// Delete a record
    Delete { kind: String, id: String },
    /// Match a JSON descriptor file ("-" for stdin) against enrolled guardians
    Recognize { descriptor: PathBuf },
    /// Show the held detection and its recognition
    Current,
    /// Record that a guardian collected a child
    Pickup { guardian_id: String, child_id: String },
    /// Delete every audit entry
    ClearAudit,
    /// Write a backup of every record
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Restore a backup written by `export`
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = PickupProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to pickupd");

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Mode { mode } => {
            proxy.set_mode(&mode).await?;
            println!("Mode: {mode}");
        }
        Commands::Register { name, role, descriptor } => {
            let guardian = match descriptor {
                Some(path) => proxy.enroll(&name, &role, read_descriptor(&path)?).await?,
                None => proxy.register_held(&name, &role).await?,
            };
            print_json(&guardian)?;
        }
        Commands::Recapture { guardian_id } => print_json(&proxy.recapture_held(&guardian_id).await?)?,
        Commands::Edit { guardian_id, name, role } => {
            if name.is_none() && role.is_none() {
                bail!("nothing to change; pass --name and/or --role");
            }
            let guardian = proxy
                .update_guardian(&guardian_id, name.as_deref().unwrap_or(""), role.as_deref().unwrap_or(""))
                .await?;
            print_json(&guardian)?;
        }
        Commands::EnrollChild { name, class, section } => {
            print_json(&proxy.enroll_child(&name, &class, &section).await?)?
        }
        Commands::Link { guardian_id, child_ids, replace } => {
            print_json(&proxy.link(&guardian_id, child_ids, replace).await?)?
        }
        Commands::List { kind } => print_json(&proxy.list(&kind).await?)?,
        Commands::Delete { kind, id } => {
            if proxy.delete(&kind, &id).await? {
                println!("Deleted {kind} {id}");
            } else {
                println!("No {kind} with id {id}");
            }
        }
        Commands::Recognize { descriptor } => {
            print_json(&proxy.recognize(read_descriptor(&descriptor)?).await?)?
        }
        Commands::Current => {
            println!("Detection:");
            print_json(&proxy.current_detection().await?)?;
            println!("Recognition:");
            print_json(&proxy.current_recognition().await?)?;
        }
        Commands::Pickup { guardian_id, child_id } => {
            print_json(&proxy.confirm_pickup(&guardian_id, &child_id).await?)?
        }
        Commands::ClearAudit => {
            let removed = proxy.clear_audit().await?;
            println!("Removed {removed} audit entries");
        }
        Commands::Export { output } => {
            let snapshot = proxy.export().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, pretty(&snapshot)?)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => print_json(&snapshot)?,
            }
        }
        Commands::Import { file } => {
            let snapshot = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            print_json(&proxy.import(&snapshot).await?)?;
        }
    }

    Ok(())
}

fn pretty(payload: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(payload).context("daemon sent invalid JSON")?;
    Ok(serde_json::to_string_pretty(&value)?)
}

fn print_json(payload: &str) -> Result<()> {
    println!("{}", pretty(payload)?);
    Ok(())
}

/// Read a descriptor: a JSON array of numbers.
fn read_descriptor(path: &Path) -> Result<Vec<f64>> {
    let text = if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        text
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&text).context("descriptor must be a JSON array of numbers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_link_parses_child_list() {
        let cli = Cli::try_parse_from(["pickup", "link", "g1", "c1", "c2", "--replace"]).unwrap();
        match cli.command {
            Commands::Link { guardian_id, child_ids, replace } => {
                assert_eq!(guardian_id, "g1");
                assert_eq!(child_ids, vec!["c1", "c2"]);
                assert!(replace);
            }
            _ => panic!("expected link"),
        }
    }

    #[test]
    fn test_link_requires_children() {
        assert!(Cli::try_parse_from(["pickup", "link", "g1"]).is_err());
    }

    #[test]
    fn test_system_flag_is_global() {
        let cli = Cli::try_parse_from(["pickup", "status", "--system"]).unwrap();
        assert!(cli.system);
    }

    #[test]
    fn test_pretty_rejects_garbage() {
        assert!(pretty("{not json").is_err());
        assert_eq!(pretty("null").unwrap(), "null");
    }
}
