mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rowflow_types::LogLevel;

#[derive(Parser)]
#[command(
    name = "rowflow",
    version,
    about = "Row pipelines on threads, one slave, or a whole cluster"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: LogLevel,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Split over the pipeline's cluster schema
        #[arg(long, conflicts_with = "remote")]
        clustered: bool,
        /// Run the whole pipeline on this slave server of the cluster schema
        #[arg(long, value_name = "NAME")]
        remote: Option<String>,
        /// Run every slave of the cluster schema inside this process
        #[arg(long)]
        local_slaves: bool,
        /// Fail steps that receive rows with differing layouts
        #[arg(long)]
        safe_mode: bool,
        /// Run variable, repeatable
        #[arg(long = "param", value_name = "K=V", value_parser = commands::run::parse_param)]
        params: Vec<(String, String)>,
        /// Copies for steps that do not declare their own
        #[arg(long)]
        copies: Option<u32>,
        /// Row queue capacity
        #[arg(long)]
        queue_capacity: Option<usize>,
    },
    /// Validate a pipeline and, if it has a cluster schema, its split
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Print the per-node sub-graphs and cuts of a clustered run
    Split {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Serve this process as a slave server
    Serve {
        /// Slave server name used in logs and step labels
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long)]
        port: u16,
        /// Require this username from the master
        #[arg(long, requires = "password")]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_level.as_str());

    match cli.command {
        Commands::Run {
            pipeline,
            clustered,
            remote,
            local_slaves,
            safe_mode,
            params,
            copies,
            queue_capacity,
        } => {
            let options = commands::run::RunOptions {
                clustered,
                remote,
                local_slaves,
                safe_mode,
                params,
                copies,
                queue_capacity,
                log_level: cli.log_level,
            };
            commands::run::execute(&pipeline, options).await
        }
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
        Commands::Split { pipeline } => commands::split::execute(&pipeline),
        Commands::Serve {
            name,
            host,
            port,
            username,
            password,
        } => commands::serve::execute(name, &host, port, username, password).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "rowflow",
            "run",
            "p.yaml",
            "--clustered",
            "--param",
            "DB=prod",
            "--param",
            "LIMIT=10",
            "--copies",
            "3",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LogLevel::Debug);
        match cli.command {
            Commands::Run {
                clustered,
                params,
                copies,
                ..
            } => {
                assert!(clustered);
                assert_eq!(params.len(), 2);
                assert_eq!(params[0], ("DB".to_string(), "prod".to_string()));
                assert_eq!(copies, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_clustered_and_remote_conflict() {
        let parsed = Cli::try_parse_from(["rowflow", "run", "p.yaml", "--clustered", "--remote", "s1"]);
        assert!(parsed.is_err());
    }
}
