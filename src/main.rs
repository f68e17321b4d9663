use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use classroom_insights::analysis::AnalysisScope;
use classroom_insights::application::*;
use classroom_insights::logging::init_logging;
use classroom_insights::Config;

#[derive(Parser)]
#[command(name = "classroom-insights")]
#[command(about = "Cached, asynchronously computed analyses of classroom conversations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Server(ServerCommands),
    /// Request an analysis from a running server and wait for it
    Analyze(AnalyzeArgs),
}

/// Commands that run against the database.
#[derive(Subcommand)]
enum ServerCommands {
    /// Start the HTTP API
    Serve {
        /// Also process jobs and run the watchdog in this process
        #[arg(long)]
        embedded_worker: bool,
    },
    /// Process queued analysis jobs
    Worker,
    /// Create or update the analysis tables
    Migrate,
    /// Recover stuck jobs once and exit
    Sweep,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Analyze one student
    #[arg(long, conflicts_with_all = ["institution", "grade", "section"])]
    student: Option<String>,
    /// Institution of the class to analyze
    #[arg(long, requires_all = ["grade", "section"])]
    institution: Option<String>,
    #[arg(long)]
    grade: Option<String>,
    #[arg(long)]
    section: Option<String>,
    /// Recompute even if the cached analysis is current
    #[arg(long)]
    refresh: bool,
}

impl AnalyzeArgs {
    fn scope(&self) -> Result<AnalysisScope> {
        match (&self.student, &self.institution, &self.grade, &self.section) {
            (Some(student), None, None, None) => Ok(AnalysisScope::student(student.clone())),
            (None, Some(institution), Some(grade), Some(section)) => Ok(AnalysisScope::class(
                institution.clone(),
                grade.clone(),
                section.clone(),
            )),
            _ => Err(anyhow::anyhow!(
                "Specify either --student or --institution, --grade and --section"
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    init_logging(
        &config.operational.log_level,
        config.operational.log_format,
    )?;

    match cli.command {
        Commands::Analyze(args) => {
            let handler = AnalyzeCommandHandler::new(config);
            handler.analyze(args.scope()?, args.refresh).await
        }
        Commands::Server(command) => run_server_command(command, config).await,
    }
}

async fn run_server_command(command: ServerCommands, config: Config) -> Result<()> {
    let app = Application::new(config).await?;
    app.initialize().await?;

    let result = match command {
        ServerCommands::Serve { embedded_worker } => {
            let handler = ServerCommandHandler::new(app.container.clone(), app.lifecycle.clone());
            handler.serve(embedded_worker).await
        }
        ServerCommands::Worker => {
            let handler = WorkerCommandHandler::new(app.container.clone(), app.lifecycle.clone());
            handler.run().await
        }
        ServerCommands::Migrate => {
            let handler = DatabaseCommandHandler::new(app.container.clone());
            handler.migrate().await
        }
        ServerCommands::Sweep => {
            let handler = WatchdogCommandHandler::new(app.container.clone());
            handler.sweep().await
        }
    };

    app.shutdown().await?;
    result
}
