// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quire::{Engine, ExecutionHooks, Executor, FunctionDefinition, FunctionKind, QuireConfig, SyntaxCapabilities};
use quire::{FunctionValidator, SyntaxChecker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "quire-server", about = "Validated, sandboxed record-transformer functions")]
#[command(version)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve,
    /// Run the admission pipeline on a source file.
    Check {
        #[arg(long)]
        name: String,
        file: PathBuf,
    },
    /// Admit a source file and invoke it once.
    Run {
        #[arg(long)]
        name: String,
        file: PathBuf,
        /// JSON record passed as the single argument.
        #[arg(long)]
        record: Option<String>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = QuireConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&cli.log_level, config.server.log_json);

    match cli.cmd.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Check { name, file } => check(&config, &name, &file).await,
        Command::Run { name, file, record } => run(&config, &name, &file, record.as_deref()).await,
    }
}

async fn serve(config: QuireConfig) -> Result<()> {
    let addr = config.bind_addr()?;
    if config.auth.admin_token.is_none() {
        tracing::warn!("No admin token configured, admin routes will reject every request");
    }
    let engine = Arc::new(Engine::from_config(config).await.context("Failed to start engine")?);
    quire::api::serve(engine, addr).await.context("HTTP server failed")?;
    info!("quire-server shutting down");
    Ok(())
}

fn validator(config: &QuireConfig) -> FunctionValidator {
    FunctionValidator::new(SyntaxChecker::new(SyntaxCapabilities::resolve(&config.validation)))
}

async fn check(config: &QuireConfig, name: &str, file: &Path) -> Result<()> {
    let code = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let result = validator(config).validate_function_code(name, &code).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.valid {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: &QuireConfig, name: &str, file: &Path, record: Option<&str>) -> Result<()> {
    let code = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let verdict = validator(config).validate_function_code(name, &code).await;
    if !verdict.valid {
        bail!("{}", verdict.message);
    }
    let record = record
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--record is not valid JSON")?;

    let definition = FunctionDefinition {
        id: Uuid::new_v4(),
        name: name.trim().to_string(),
        label: name.trim().to_string(),
        source: code,
        kind: FunctionKind::OneShotTrigger,
    };
    let executor = Executor::new(&config.execution, ExecutionHooks::default());
    let result = executor.invoke(&definition, record).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
