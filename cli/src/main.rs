// courier: command-line front end and server for the Courier message store
//
// One-shot commands open the data directory, act, and exit. `serve` keeps the
// store open and pushes messages to logged-in clients.

mod config;
mod history;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::{Config, StorageBackend};
use courier_core::{
    AccountBook, AccountProfile, DispatchConfig, FilePersistence, FriendBook, GroupBook,
    MessageStore, Persistence, SledPersistence,
};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier: direct and group messaging with live delivery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Manage groups
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
    /// Send a message as <from> to a user or group
    Send {
        from: String,
        /// "user" or "group"
        kind: String,
        target: String,
        text: String,
    },
    /// View message history
    History {
        /// Conversation between two users
        #[arg(long, num_args = 2, value_names = ["USER_A", "USER_B"], conflicts_with = "group")]
        with: Option<Vec<String>>,
        /// Messages sent to a group
        #[arg(short, long)]
        group: Option<String>,
        /// Show only the most recent N messages
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Start the delivery server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    Add {
        username: String,
        #[arg(short, long)]
        password: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        address: String,
    },
    List,
    Show { username: String },
    Remove { username: String },
}

#[derive(Subcommand)]
enum GroupAction {
    Create,
    List {
        /// Only groups this user belongs to
        #[arg(short, long)]
        user: Option<String>,
    },
    Show { id: String },
    AddMember { id: String, username: String },
    RemoveMember { id: String, username: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

/// Everything a command needs from the data directory
struct Workspace {
    accounts: Arc<AccountBook>,
    groups: Arc<GroupBook>,
    friends: Arc<FriendBook>,
    store: MessageStore,
}

impl Workspace {
    fn open(config: &Config, dispatch: DispatchConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;

        let accounts = Arc::new(
            AccountBook::open(data_dir.join("accounts.json"))
                .context("Failed to open account book")?,
        );
        let groups = Arc::new(
            GroupBook::open(data_dir.join("groups.json"), accounts.clone())
                .context("Failed to open group book")?,
        );
        let friends = Arc::new(
            FriendBook::open(data_dir.join("friends.json"), accounts.clone())
                .context("Failed to open friend lists")?,
        );

        let persistence: Arc<dyn Persistence> = match config.backend {
            StorageBackend::File => Arc::new(FilePersistence::new(data_dir.join("messages.json"))),
            StorageBackend::Sled => Arc::new(
                SledPersistence::open(data_dir.join("messages.sled"))
                    .context("Failed to open message database")?,
            ),
        };

        let store = MessageStore::initialize(accounts.clone(), groups.clone(), persistence, dispatch)
            .context("Failed to load message log")?;

        tracing::debug!("Opened workspace at {}", data_dir.display());
        Ok(Self {
            accounts,
            groups,
            friends,
            store,
        })
    }
}

fn init_logging(log_dir: Option<&str>, default_level: &str) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "courier.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    let _log_guard = init_logging(config.log_dir.as_deref(), default_level);

    match cli.command {
        Commands::User { action } => cmd_user(&config, action),
        Commands::Group { action } => cmd_group(&config, action),
        Commands::Send {
            from,
            kind,
            target,
            text,
        } => cmd_send(&config, from, kind, target, text),
        Commands::History { with, group, limit } => cmd_history(&config, with, group, limit),
        Commands::Serve { port } => cmd_serve(config, port).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn cmd_user(config: &Config, action: UserAction) -> Result<()> {
    let workspace = Workspace::open(config, DispatchConfig::inline())?;
    let accounts = &workspace.accounts;

    match action {
        UserAction::Add {
            username,
            password,
            first_name,
            last_name,
            email,
            address,
        } => {
            let profile = AccountProfile {
                first_name,
                last_name,
                email,
                address,
            };
            accounts.create_user(&username, &password, profile)?;
            println!("{} User created: {}", "✓".green(), username.bright_cyan());
        }

        UserAction::List => {
            let usernames = accounts.usernames();
            if usernames.is_empty() {
                println!("{}", "No users yet.".dimmed());
            } else {
                println!("{} ({} total)", "Users".bold(), usernames.len());
                println!();
                for username in usernames {
                    println!("  {} {}", "•".bright_green(), username.bright_cyan());
                }
            }
        }

        UserAction::Show { username } => {
            let account = accounts.get_user(&username)?;
            let profile = &account.profile;
            let full_name = format!("{} {}", profile.first_name, profile.last_name);

            println!("{}", "User Details".bold());
            println!("  Username: {}", account.username.bright_cyan());
            println!("  Name:     {}", full_name.trim());
            println!("  Email:    {}", profile.email);
            println!("  Address:  {}", profile.address);

            let groups = workspace.groups.groups_with_user(&username)?;
            println!("  Groups:   {}", groups.len());
            let friends = workspace.friends.friends_of(&username)?;
            println!("  Friends:  {}", friends.join(", "));
        }

        UserAction::Remove { username } => {
            accounts.delete_user(&username)?;
            println!("{} Removed user: {}", "✓".green(), username.bright_cyan());
        }
    }

    Ok(())
}

fn cmd_group(config: &Config, action: GroupAction) -> Result<()> {
    let workspace = Workspace::open(config, DispatchConfig::inline())?;
    let groups = &workspace.groups;

    match action {
        GroupAction::Create => {
            let id = groups.create_group()?;
            println!("{} Group created: {}", "✓".green(), id.bright_cyan());
        }

        GroupAction::List { user } => {
            let ids = match user {
                Some(username) => groups.groups_with_user(&username)?,
                None => groups.group_ids(),
            };

            if ids.is_empty() {
                println!("{}", "No groups.".dimmed());
            } else {
                println!("{} ({} total)", "Groups".bold(), ids.len());
                println!();
                for id in ids {
                    let group = groups.get_group(&id)?;
                    println!("  {} {}", "•".bright_green(), group.id.bright_cyan());
                    println!("    {}", group.display_name().dimmed());
                }
            }
        }

        GroupAction::Show { id } => {
            let group = groups.get_group(&id)?;
            let history = workspace.store.get_all_in_group(&id)?;

            println!("{}", "Group Details".bold());
            println!("  Id:       {}", group.id.bright_cyan());
            println!("  Members:  {}", group.display_name());
            println!("  Messages: {}", history.len());
        }

        GroupAction::AddMember { id, username } => {
            groups.add_member(&id, &username)?;
            println!("{} Added {} to {}", "✓".green(), username.bright_cyan(), id);
        }

        GroupAction::RemoveMember { id, username } => {
            groups.remove_member(&id, &username)?;
            println!("{} Removed {} from {}", "✓".green(), username.bright_cyan(), id);
        }

        GroupAction::Delete { id } => {
            groups.delete_group(&id)?;
            println!("{} Deleted group: {}", "✓".green(), id.bright_cyan());
        }
    }

    Ok(())
}

fn cmd_send(config: &Config, from: String, kind: String, target: String, text: String) -> Result<()> {
    let workspace = Workspace::open(config, DispatchConfig::inline())?;

    let message = workspace.store.send_with_kind(&from, &kind, &text, &target)?;
    workspace.store.shutdown()?;

    println!("{} Sent", "✓".green());
    println!("  {}", history::render_line(&message).dimmed());
    Ok(())
}

fn cmd_history(
    config: &Config,
    with: Option<Vec<String>>,
    group: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let workspace = Workspace::open(config, DispatchConfig::inline())?;

    let (conversation, messages) = match (with, group) {
        (Some(pair), None) => {
            let [a, b]: [String; 2] = pair
                .try_into()
                .map_err(|_| anyhow::anyhow!("--with takes exactly two usernames"))?;
            for username in [&a, &b] {
                // surfaces a typo instead of an empty conversation
                workspace.accounts.get_user(username)?;
            }
            let messages = workspace.store.get_all_with_users(&a, &b);
            (history::Conversation::Pair(a, b), messages)
        }
        (None, Some(id)) => {
            let messages = workspace.store.get_all_in_group(&id)?;
            (history::Conversation::Group(id), messages)
        }
        _ => anyhow::bail!("Specify either --with <USER_A> <USER_B> or --group <ID>"),
    };

    history::print_messages(&conversation, &history::tail(messages, limit));
    Ok(())
}

async fn cmd_serve(config: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let workspace = Workspace::open(&config, config.dispatch.clone())?;

    println!("{}", "Courier: Starting...".bold());
    println!("  {} Users:    {}", "✓".green(), workspace.accounts.usernames().len());
    println!("  {} Groups:   {}", "✓".green(), workspace.groups.group_ids().len());
    println!("  {} Messages: {}", "✓".green(), workspace.store.len());
    println!(
        "  {} Listening on {}:{}",
        "✓".green(),
        config.listen_address,
        port
    );
    println!();
    println!("{}", "Press Ctrl-C to stop.".dimmed());

    let server = server::Server::new(
        workspace.accounts,
        workspace.groups,
        workspace.friends,
        workspace.store,
    );
    server::run(server, &config.listen_address, port).await?;

    println!("{} Stopped", "✓".green());
    Ok(())
}

fn cmd_config(mut config: Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else if config.list().iter().any(|(k, _)| *k == key) {
                println!("{} = {}", key.bright_cyan(), "(unset)".dimmed());
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            println!("  Config file: {}", Config::config_file()?.display());
        }
    }

    Ok(())
}
