use clap::Subcommand;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// List local audit entries, newest first
    List {
        /// Data directory holding config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Only entries for this city
        #[arg(long)]
        city: Option<String>,

        /// Only entries for this institution (requires --city)
        #[arg(long, requires = "city")]
        institution: Option<String>,

        /// Only entries made by this principal
        #[arg(long)]
        principal_id: Option<String>,

        /// Only entries of this kind (e.g., "edit", "permission_change")
        #[arg(long)]
        action: Option<String>,

        /// Maximum number of entries to print
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the aggregated activity summary
    Summary {
        /// Data directory holding config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },

    /// Recompute the summary from the local logs
    RebuildSummary {
        /// Data directory holding config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },

    /// Push local entries missing from the remote audit table
    Reconcile {
        /// Data directory holding config, caches and audit logs
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },
}
