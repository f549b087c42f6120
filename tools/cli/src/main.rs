//! PassVault CLI - Command line interface for password vaults.
//!
//! Every command unlocks the vault it works on, performs one operation
//! and locks it again before exiting.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use passvault_common::VaultId;
use passvault_crypto::KdfParams;
use passvault_storage::{JsonFileRegistry, LocalStore, StorageLocation};
use passvault_vault::{Entry, Folder, SessionConfig, SessionManager, SoftwareKeystore, Tag};

const REGISTRY_FILENAME: &str = "registry.json";

#[derive(Parser)]
#[command(name = "passvault")]
#[command(about = "PassVault - Encrypted password vaults")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding the vault registry.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON session configuration file. Defaults come from PASSVAULT_* variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Create {
        /// Display name.
        #[arg(short, long)]
        name: String,

        /// Vault file to create.
        #[arg(short, long)]
        path: PathBuf,

        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long, default_value = "interactive")]
        strength: String,
    },

    /// List registered vaults.
    List,

    /// List the entries of a vault.
    Entries {
        #[arg(long)]
        vault: String,

        /// Only entries in this folder.
        #[arg(short, long)]
        folder: Option<String>,
    },

    /// Add an entry. The entry password is prompted for.
    Add {
        #[arg(long)]
        vault: String,

        #[arg(short, long)]
        title: String,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(long)]
        url: Option<String>,

        /// Folder id to file the entry under.
        #[arg(short, long)]
        folder: Option<String>,
    },

    /// Remove an entry.
    Remove {
        #[arg(long)]
        vault: String,

        /// Entry id.
        #[arg(short, long)]
        entry: String,
    },

    /// List, add or delete folders.
    Folders {
        #[arg(long)]
        vault: String,

        /// Name of a folder to create.
        #[arg(long)]
        add: Option<String>,

        /// Id of a folder to delete. Its entries are kept.
        #[arg(long)]
        delete: Option<String>,
    },

    /// List, add, delete or attach tags.
    Tags {
        #[arg(long)]
        vault: String,

        /// Name of a tag to create.
        #[arg(long)]
        add: Option<String>,

        /// Id of a tag to delete.
        #[arg(long)]
        delete: Option<String>,

        /// Attach `--tag` to this entry id.
        #[arg(long, requires = "tag")]
        entry: Option<String>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Show vault information.
    Info {
        #[arg(long)]
        vault: String,
    },

    /// Change the master password.
    ChangePassword {
        #[arg(long)]
        vault: String,
    },

    /// Write an encrypted backup.
    Export {
        #[arg(long)]
        vault: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Replace a vault's contents with a backup.
    Import {
        #[arg(long)]
        vault: String,

        #[arg(short, long)]
        input: PathBuf,
    },

    /// Delete a vault file and forget it.
    Delete {
        #[arg(long)]
        vault: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Commands::Create { strength, .. } = &cli.command {
        config.kdf = parse_strength(strength)?;
    }
    let manager = build_manager(cli.data_dir, config).await?;

    let result = run(&manager, cli.command).await;
    manager.lock().await;
    result
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            SessionConfig::from_json(&json).context("Invalid configuration file")
        }
        None => SessionConfig::from_env().context("Invalid PASSVAULT_* environment"),
    }
}

fn parse_strength(strength: &str) -> Result<KdfParams> {
    Ok(match strength {
        "interactive" => KdfParams::interactive(),
        "moderate" => KdfParams::moderate(),
        "sensitive" => KdfParams::sensitive(),
        _ => anyhow::bail!("Invalid strength. Use: interactive, moderate, or sensitive"),
    })
}

async fn build_manager(data_dir: Option<PathBuf>, config: SessionConfig) -> Result<SessionManager> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No data directory on this platform, pass --data-dir")?
            .join("passvault"),
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let registry = JsonFileRegistry::open(data_dir.join(REGISTRY_FILENAME))
        .await
        .context("Failed to open vault registry")?;

    Ok(SessionManager::new(
        config,
        Arc::new(LocalStore::new()),
        Arc::new(registry),
        Arc::new(SoftwareKeystore::new()),
    ))
}

async fn run(manager: &SessionManager, command: Commands) -> Result<()> {
    match command {
        Commands::Create { name, path, .. } => cmd_create(manager, &name, path).await,
        Commands::List => cmd_list(manager).await,
        Commands::Entries { vault, folder } => cmd_entries(manager, &vault, folder).await,
        Commands::Add {
            vault,
            title,
            username,
            url,
            folder,
        } => cmd_add(manager, &vault, title, username, url, folder).await,
        Commands::Remove { vault, entry } => cmd_remove(manager, &vault, &entry).await,
        Commands::Folders { vault, add, delete } => {
            cmd_folders(manager, &vault, add, delete).await
        }
        Commands::Tags {
            vault,
            add,
            delete,
            entry,
            tag,
        } => cmd_tags(manager, &vault, add, delete, entry.zip(tag)).await,
        Commands::Info { vault } => cmd_info(manager, &vault).await,
        Commands::ChangePassword { vault } => cmd_change_password(manager, &vault).await,
        Commands::Export { vault, output } => cmd_export(manager, &vault, &output).await,
        Commands::Import { vault, input } => cmd_import(manager, &vault, &input).await,
        Commands::Delete { vault } => cmd_delete(manager, &vault).await,
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

/// Prompt twice and require both to match.
fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm password: ")?;

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

async fn unlock(manager: &SessionManager, vault: &str) -> Result<VaultId> {
    let vault_id = VaultId::new(vault).context("Invalid vault id")?;
    let password = prompt_password("Master password: ")?;

    if let Err(e) = manager.unlock(&vault_id, password.as_bytes()).await {
        anyhow::bail!(e.user_message());
    }
    Ok(vault_id)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn cmd_create(manager: &SessionManager, name: &str, path: PathBuf) -> Result<()> {
    info!("Creating new vault: {}", name);

    let password = prompt_new_password("Master password: ")?;
    let location = StorageLocation::File(path.clone());

    let vault_id = manager
        .create_vault(name, location, password.as_bytes())
        .await
        .context("Failed to create vault")?;

    println!("Vault created successfully!");
    println!("  ID: {}", vault_id);
    println!("  Location: {}", path.display());

    Ok(())
}

async fn cmd_list(manager: &SessionManager) -> Result<()> {
    let vaults = manager.list_vaults().await?;

    if vaults.is_empty() {
        println!("No vaults registered.");
        return Ok(());
    }

    for vault in vaults {
        println!("{}  {}", vault.id, vault.name);
        println!("    {}", vault.location);
        println!(
            "    {} entries, {} folders, {} tags",
            vault.stats.entry_count, vault.stats.folder_count, vault.stats.tag_count
        );
    }
    Ok(())
}

async fn cmd_entries(manager: &SessionManager, vault: &str, folder: Option<String>) -> Result<()> {
    unlock(manager, vault).await?;

    let entries = match folder {
        Some(folder) => manager.entries_in_folder(&folder).await?,
        None => manager.get_entries().await?,
    };

    if entries.is_empty() {
        println!("No entries.");
    }
    for entry in entries {
        let tags: Vec<String> = manager
            .tags_for_entry(&entry.id)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        println!(
            "{}  {}  {}",
            entry.id,
            entry.title,
            entry.username.as_deref().unwrap_or("-")
        );
        if !tags.is_empty() {
            println!("    tags: {}", tags.join(", "));
        }
    }
    Ok(())
}

async fn cmd_add(
    manager: &SessionManager,
    vault: &str,
    title: String,
    username: Option<String>,
    url: Option<String>,
    folder: Option<String>,
) -> Result<()> {
    unlock(manager, vault).await?;
    let secret = prompt_password("Entry password (empty for none): ")?;

    let mut entry = Entry::new(new_id(), title);
    entry.username = username;
    entry.url = url;
    entry.folder_id = folder;
    if !secret.is_empty() {
        entry.password = Some(secret.to_string());
    }
    let id = entry.id.clone();

    manager.add_entry(entry).await.context("Failed to add entry")?;
    println!("Entry added: {}", id);
    Ok(())
}

async fn cmd_remove(manager: &SessionManager, vault: &str, entry: &str) -> Result<()> {
    unlock(manager, vault).await?;
    manager
        .delete_entry(entry)
        .await
        .context("Failed to remove entry")?;
    println!("Entry removed: {}", entry);
    Ok(())
}

async fn cmd_folders(
    manager: &SessionManager,
    vault: &str,
    add: Option<String>,
    delete: Option<String>,
) -> Result<()> {
    unlock(manager, vault).await?;

    if let Some(name) = add {
        let folder = Folder::new(new_id(), name);
        println!("Folder added: {}", folder.id);
        manager.add_folder(folder).await?;
    }
    if let Some(id) = delete {
        manager.delete_folder(&id).await?;
        println!("Folder deleted: {}", id);
    }

    for folder in manager.get_folders().await? {
        let count = manager.entries_in_folder(&folder.id).await?.len();
        println!("{}  {} ({} entries)", folder.id, folder.name, count);
    }
    Ok(())
}

async fn cmd_tags(
    manager: &SessionManager,
    vault: &str,
    add: Option<String>,
    delete: Option<String>,
    link: Option<(String, String)>,
) -> Result<()> {
    unlock(manager, vault).await?;

    if let Some(name) = add {
        let tag = Tag::new(new_id(), name);
        println!("Tag added: {}", tag.id);
        manager.add_tag(tag).await?;
    }
    if let Some(id) = delete {
        manager.delete_tag(&id).await?;
        println!("Tag deleted: {}", id);
    }
    if let Some((entry, tag)) = link {
        manager.add_tag_to_entry(&entry, &tag).await?;
        println!("Tagged {} with {}", entry, tag);
    }

    for tag in manager.get_tags().await? {
        println!("{}  {}", tag.id, tag.name);
    }
    Ok(())
}

async fn cmd_info(manager: &SessionManager, vault: &str) -> Result<()> {
    let vault_id = unlock(manager, vault).await?;

    let snapshot = manager.snapshot().await?;
    let vaults = manager.list_vaults().await?;
    let entry = vaults
        .iter()
        .find(|v| v.id == vault_id)
        .context("Vault missing from registry")?;

    println!("Vault Information:");
    println!("  ID: {}", entry.id);
    println!("  Name: {}", entry.name);
    println!("  Location: {}", entry.location);
    println!("  Created: {}", entry.created_at);
    if let Some(modified) = entry.last_modified {
        println!("  Modified: {}", modified);
    }
    println!("  Entries: {}", snapshot.entries.len());
    println!("  Folders: {}", snapshot.folders.len());
    println!("  Tags: {}", snapshot.tags.len());
    println!("  Presets: {}", snapshot.presets.len());
    println!("  Size: {} bytes", entry.stats.size_bytes);
    println!(
        "  Biometric unlock: {}",
        if entry.biometric_unlock_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}

async fn cmd_change_password(manager: &SessionManager, vault: &str) -> Result<()> {
    info!("Changing vault password");
    unlock(manager, vault).await?;

    let current = prompt_password("Enter current password: ")?;
    let new_password = prompt_new_password("Enter new password: ")?;

    manager
        .change_master_password(current.as_bytes(), new_password.as_bytes())
        .await
        .context("Failed to change password")?;

    println!("Password changed successfully!");
    Ok(())
}

async fn cmd_export(manager: &SessionManager, vault: &str, output: &Path) -> Result<()> {
    unlock(manager, vault).await?;
    let password = prompt_new_password("Backup password: ")?;

    let backup = manager.export_backup(password.as_bytes()).await?;
    tokio::fs::write(output, backup)
        .await
        .context("Failed to write backup")?;

    println!("Backup written: {}", output.display());
    Ok(())
}

async fn cmd_import(manager: &SessionManager, vault: &str, input: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(input)
        .await
        .context("Failed to read backup")?;
    unlock(manager, vault).await?;
    let password = prompt_password("Backup password: ")?;

    manager
        .restore_backup(&text, password.as_bytes())
        .await
        .context("Failed to restore backup")?;

    let count = manager.get_entries().await?.len();
    println!("Backup restored: {} entries", count);
    Ok(())
}

async fn cmd_delete(manager: &SessionManager, vault: &str) -> Result<()> {
    let vault_id = unlock(manager, vault).await?;
    manager
        .remove_vault(&vault_id)
        .await
        .context("Failed to delete vault")?;
    println!("Vault deleted: {}", vault_id);
    Ok(())
}
