use anyhow::{bail, Context, Result};
use at_core::prelude::*;
use at_core::{
    ConfigId, Direction, ExampleRecord, JobId, RecordStore, SchemaCanonicalizer, SchemaSource, VcsProvider,
    VersionControl,
};
use at_github::GithubClient;
use at_model::{ModelClient, OpenAiClient, RetryingClient};
use at_sandbox::PythonSandbox;
use clap::{value_parser, Arg, ArgGroup, ArgMatches, Command};
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("autotransform")
        .version(at_core::VERSION)
        .about("Synthesize, validate and repair record transformations")
        .subcommand_required(true)
        .arg(
            Arg::new("settings")
                .long("settings")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML settings file; AUTOTRANSFORM_* variables override it"),
        )
        .subcommand(
            Command::new("parse-schema")
                .about("Derive an output schema from a description or labeled examples")
                .arg(
                    Arg::new("description")
                        .long("description")
                        .help("Free-form description of the output"),
                )
                .arg(
                    Arg::new("examples")
                        .long("examples")
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON lines of {\"input\": ..., \"output\": ...}"),
                )
                .group(
                    ArgGroup::new("source")
                        .args(["description", "examples"])
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run a job and write the updated config back")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Config JSON (a stored config or a create request)"),
                )
                .arg(
                    Arg::new("records")
                        .long("records")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Input records as JSON lines"),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Stream a stored batch as JSON lines")
                .arg(Arg::new("config-id").long("config-id").required(true))
                .arg(Arg::new("job-id").long("job-id").required(true))
                .arg(
                    Arg::new("direction")
                        .long("direction")
                        .default_value("output")
                        .value_parser(["input", "output"]),
                ),
        )
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if settings.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Non-empty lines of `path`, each parsed as JSON
fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid JSON", path.display(), i + 1))
        })
        .collect()
}

/// A config file holds either a stored config or a create request
enum ConfigFile {
    Stored(ServiceConfig),
    Request(UpsertConfig),
}

fn read_config(path: &Path) -> Result<ConfigFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not JSON", path.display()))?;
    if let Ok(config) = serde_json::from_value::<ServiceConfig>(value.clone()) {
        return Ok(ConfigFile::Stored(config));
    }
    let request = serde_json::from_value::<UpsertConfig>(value)
        .with_context(|| format!("{} is neither a config nor a config request", path.display()))?;
    Ok(ConfigFile::Request(request))
}

fn model(settings: &Settings) -> Result<Arc<dyn ModelClient>> {
    let client = OpenAiClient::new(settings.model.clone()).context("model client")?;
    Ok(Arc::new(RetryingClient::with_backoff(
        client,
        settings.transport_retry.clone(),
    )))
}

fn version_control(settings: &Settings) -> Result<Option<Arc<dyn VersionControl>>> {
    match settings.vcs.provider {
        VcsProvider::None => Ok(None),
        VcsProvider::Github => {
            let client = GithubClient::new(&settings.vcs.api_url, settings.vcs.token.as_deref())
                .context("GitHub client")?;
            Ok(Some(Arc::new(client)))
        }
    }
}

async fn parse_schema(settings: &Settings, args: &ArgMatches) -> Result<()> {
    let source = if let Some(description) = args.get_one::<String>("description") {
        SchemaSource::Description(description.clone())
    } else if let Some(path) = args.get_one::<PathBuf>("examples") {
        let examples = read_jsonl(path)?
            .into_iter()
            .map(serde_json::from_value::<ExampleRecord>)
            .collect::<Result<Vec<_>, _>>()
            .context("examples must be {\"input\": {...}, \"output\": ...}")?;
        SchemaSource::Examples(examples)
    } else {
        bail!("either --description or --examples is required");
    };
    let canonical = SchemaCanonicalizer::new(model(settings)?)
        .canonicalize(source)
        .await?;
    println!("{}", serde_json::to_string_pretty(&canonical.schema)?);
    Ok(())
}

async fn run(settings: &Settings, args: &ArgMatches) -> Result<bool> {
    let config_path = args
        .get_one::<PathBuf>("config")
        .context("--config is required")?;
    let records_path = args
        .get_one::<PathBuf>("records")
        .context("--records is required")?;
    let records = read_jsonl(records_path)?;

    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let gate = ReviewGate::new(store.clone(), version_control(settings)?)
        .with_backoff(settings.transport_retry.clone())
        .with_base_url(settings.base_url.clone());
    let configs = ConfigService::new(store.clone(), gate.clone());
    let config_id = match read_config(config_path)? {
        ConfigFile::Stored(config) => {
            let id = config.id;
            store.insert_config(config).await?;
            id
        }
        ConfigFile::Request(request) => configs.upsert(request).await?.id,
    };

    let controller = Arc::new(AttemptController::from_settings(
        settings,
        store.clone(),
        Arc::new(LocalRecordStore::new(&settings.data_dir)),
        model(settings)?,
        Arc::new(PythonSandbox::new(settings.python.clone())),
        gate,
    ));
    let job = controller.submit(config_id, records).await?;
    tracing::info!("job {} submitted", job.id);

    let mut events = controller.subscribe(job.id).await?;
    let mut last = job;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let JobEvent::Status(job) | JobEvent::Snapshot { job, .. } = event {
                    last = job;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received; stopping job {} after the current attempt", last.id);
                controller.stop(last.id).await?;
            }
        }
    }

    let config = store.get_config(config_id).await?;
    std::fs::write(config_path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    tracing::info!("job {} ended {}; config written to {}", last.id, last.status, config_path.display());
    Ok(matches!(last.status, JobStatus::Completed | JobStatus::AwaitingReview))
}

async fn export(settings: &Settings, args: &ArgMatches) -> Result<()> {
    let config_id: ConfigId = args
        .get_one::<String>("config-id")
        .context("--config-id is required")?
        .parse()
        .context("invalid config id")?;
    let job_id: JobId = args
        .get_one::<String>("job-id")
        .context("--job-id is required")?
        .parse()
        .context("invalid job id")?;
    let direction: Direction = args
        .get_one::<String>("direction")
        .map_or("output", String::as_str)
        .parse()
        .map_err(anyhow::Error::msg)?;

    let store = LocalRecordStore::new(&settings.data_dir);
    let mut lines = store.export(config_id, job_id, direction).await?;
    while let Some(line) = lines.next().await {
        println!("{}", line?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let settings = Settings::load(matches.get_one::<PathBuf>("settings").map(PathBuf::as_path))
        .context("failed to load settings")?;
    init_tracing(&settings);

    match matches.subcommand() {
        Some(("parse-schema", args)) => parse_schema(&settings, args).await,
        Some(("run", args)) => {
            let succeeded = run(&settings, args).await?;
            std::process::exit(if succeeded { 0 } else { 1 });
        }
        Some(("export", args)) => export(&settings, args).await,
        _ => bail!("unknown command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn parse_schema_requires_a_source() {
        assert!(cli().try_get_matches_from(["autotransform", "parse-schema"]).is_err());
        assert!(cli()
            .try_get_matches_from(["autotransform", "parse-schema", "--description", "phones"])
            .is_ok());
    }

    #[test]
    fn jsonl_skips_blank_lines_and_reports_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\": 1}}\n\n{{\"a\": 2}}").unwrap();
        assert_eq!(read_jsonl(file.path()).unwrap().len(), 2);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "{{\"a\": 1}}\nnot json").unwrap();
        let err = read_jsonl(bad.path()).unwrap_err();
        assert!(err.to_string().ends_with(":2: invalid JSON"));
    }

    #[test]
    fn config_file_accepts_request_or_stored_config() {
        let mut request = tempfile::NamedTempFile::new().unwrap();
        write!(request, "{{\"name\": \"phones\", \"output_schema\": {{\"type\": \"object\"}}}}").unwrap();
        assert!(matches!(read_config(request.path()).unwrap(), ConfigFile::Request(_)));

        let stored = ServiceConfig::new("phones", serde_json::json!({"type": "object"}));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&stored).unwrap()).unwrap();
        match read_config(file.path()).unwrap() {
            ConfigFile::Stored(config) => assert_eq!(config.id, stored.id),
            ConfigFile::Request(_) => panic!("stored config parsed as request"),
        }
    }
}
