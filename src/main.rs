use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rostersync::cli::{self, AuditCommands, InitOptions};

#[derive(Parser)]
#[command(name = "rostersync")]
#[command(about = "Keeps an employee roster in sync across devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file and create the cache key
    Init {
        /// Data directory for config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Base URL of the remote service
        #[arg(long, default_value = "http://127.0.0.1:54321")]
        base_url: String,

        /// Principal id issued by the login handshake
        #[arg(long)]
        principal_id: Option<String>,

        /// Store caches and audit logs unencrypted
        #[arg(long)]
        no_encrypt: bool,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Register this principal remotely and seed the permission cache
    Login {
        /// Data directory for config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Name shown in audit entries
        #[arg(long)]
        display_name: String,

        #[arg(long)]
        email: Option<String>,
    },

    /// Download the full dataset once
    Sync {
        /// Data directory for config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll and listen for changes until interrupted
    Run {
        /// Data directory for config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },

    /// Check an action against the cached permissions
    Check {
        /// Action name (e.g., "can_edit_employee")
        action: String,

        /// Data directory for config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,

        #[arg(long)]
        city: Option<String>,

        /// Institution within --city
        #[arg(long, requires = "city")]
        institution: Option<String>,
    },

    /// Show local sync state
    Status {
        /// Data directory for config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect and repair the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("rostersync=info".parse()?))
        .init();

    let args = Cli::parse();

    match args.command {
        Commands::Init {
            data_dir,
            base_url,
            principal_id,
            no_encrypt,
            force,
        } => cli::run_init(InitOptions {
            data_dir,
            base_url,
            principal_id,
            no_encrypt,
            force,
        })?,
        Commands::Login {
            data_dir,
            display_name,
            email,
        } => cli::run_login(data_dir, display_name, email).await?,
        Commands::Sync { data_dir, json } => cli::run_sync(data_dir, json).await?,
        Commands::Run { data_dir } => cli::run_watch(data_dir).await?,
        Commands::Check {
            action,
            data_dir,
            city,
            institution,
        } => cli::run_check(data_dir, action, city, institution)?,
        Commands::Status { data_dir, json } => cli::run_status(data_dir, json)?,
        Commands::Audit { command } => match command {
            AuditCommands::List {
                data_dir,
                city,
                institution,
                principal_id,
                action,
                limit,
                json,
            } => cli::run_audit_list(data_dir, city, institution, principal_id, action, limit, json)?,
            AuditCommands::Summary { data_dir } => cli::run_audit_summary(data_dir)?,
            AuditCommands::RebuildSummary { data_dir } => cli::run_audit_rebuild_summary(data_dir)?,
            AuditCommands::Reconcile { data_dir } => cli::run_audit_reconcile(data_dir).await?,
        },
    }

    Ok(())
}
