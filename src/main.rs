use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailgraph", version, about = "Read Outlook mail through Microsoft Graph")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to ~/.mailgraph/mailgraph.toml)
    #[arg(long, global = true, env = "MAILGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log progress to stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sign in through the browser and cache the token
    Login,
    /// Show the cached token's state without contacting the server
    Status,
    /// Resolve folder paths such as "Inbox/Logger/Device;Archive" to IDs
    Folders { paths: String },
    /// Fetch messages from one or more folders
    Messages(MessagesArgs),
}

#[derive(Debug, Args)]
struct MessagesArgs {
    /// Folder paths separated by ';' (defaults to the inbox)
    #[arg(long)]
    folders: Option<String>,
    /// OData $select fields
    #[arg(long)]
    select: Option<String>,
    /// OData $filter expression (defaults to messages received today, UTC)
    #[arg(long)]
    filter: Option<String>,
    /// Page size and per-folder cap
    #[arg(long)]
    top: Option<u32>,
    /// Print message bodies instead of a summary table
    #[arg(long)]
    bodies: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{Context, Result};

    use mailgraph::graph::messages::MessageQuery;
    use mailgraph::output::{self, OutputFormat};
    use mailgraph::{MailClient, Settings};

    use super::{Cli, Commands, MessagesArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let client = open_client(&cli)?;
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Login => handle_login(&client, format).await,
            Commands::Status => handle_status(&client, format),
            Commands::Folders { paths } => handle_folders(&client, &paths, format).await,
            Commands::Messages(args) => handle_messages(&client, args, format).await,
        }
    }

    fn open_client(cli: &Cli) -> Result<MailClient> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => Settings::default_path().context("resolve default settings path")?,
        };
        let settings = Settings::load(&path)
            .with_context(|| format!("load settings from {}", path.display()))?;
        MailClient::new(settings).context("set up mail client")
    }

    async fn handle_login(client: &MailClient, format: OutputFormat) -> Result<()> {
        let record = client.login().await.context("interactive login")?;
        println!("{}", output::format_login(format, &record)?);
        Ok(())
    }

    fn handle_status(client: &MailClient, format: OutputFormat) -> Result<()> {
        let status = client.token_status();
        println!("{}", output::format_token_status(format, &status)?);
        Ok(())
    }

    async fn handle_folders(client: &MailClient, paths: &str, format: OutputFormat) -> Result<()> {
        let folder_ids = client
            .folder_ids(Some(paths))
            .await
            .with_context(|| format!("resolve folders '{paths}'"))?;
        println!("{}", output::format_folder_ids(format, &folder_ids)?);
        Ok(())
    }

    async fn handle_messages(
        client: &MailClient,
        args: MessagesArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let query = build_query(&args);
        let report = client
            .get_messages(args.folders.as_deref(), Some(query))
            .await
            .context("fetch messages")?;
        println!("{}", output::format_messages(format, &report, args.bodies)?);
        Ok(())
    }

    fn build_query(args: &MessagesArgs) -> MessageQuery {
        let mut query = MessageQuery::default();
        if let Some(select) = &args.select {
            query.select = select.clone();
        }
        if let Some(filter) = &args.filter {
            query.filter = Some(filter.clone());
        }
        query.top = args.top;
        query
    }
}
