use clap::{Parser, Subcommand, ValueEnum};
use opwatch::journal::OperationJournal;
use opwatch::model::ResourceKind;
use opwatch::{
    Action, BuildSpec, Engine, EngineConfig, EngineError, OperationId, OperationKind, Phase,
    StatusRecord, TargetRef,
};
use serde_json::{Value, json};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ENV_LOG: &str = "OPWATCH_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "opwatch")]
#[command(about = "Launch and watch image builds, pulls and container actions", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Print the release tag and exit
    #[arg(long)]
    version: bool,

    /// Remote base url (overrides OPWATCH_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Path segment before every resource path
    #[arg(long, global = true)]
    prefix: Option<String>,

    #[arg(long, global = true)]
    token: Option<String>,

    /// sqlite:// url of the local operation journal
    #[arg(long, global = true)]
    db_url: Option<String>,

    /// Trust remote failures without checking the image listing
    #[arg(long, global = true)]
    no_verify: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an image and wait for it to finish
    Build {
        #[arg(long, default_value = "Dockerfile")]
        dockerfile: String,
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Print the operation id and return without waiting
        #[arg(long)]
        detach: bool,
    },
    /// Pull an image and wait for it to finish
    Pull {
        image: String,
        #[arg(long)]
        detach: bool,
    },
    /// Run a container action (create, start, stop, delete)
    Container {
        action: String,
        /// Container name
        target: String,
        /// Container id, when known
        #[arg(long)]
        id: Option<String>,
        /// Extra JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Load past builds and pulls and print them
    History {
        /// Wait for entries that are still running
        #[arg(long)]
        follow: bool,
    },
    /// Watch an operation started elsewhere
    Watch {
        id: String,
        #[arg(long, value_enum)]
        kind: WatchKind,
        #[arg(long, default_value = "")]
        target: String,
    },
    /// Resume watching operations left unfinished in the journal
    Resume,
    /// Print the current image or container listing
    List {
        #[arg(value_enum)]
        resource: ListResource,
    },
    /// Print the release tag
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WatchKind {
    Build,
    Pull,
}

impl WatchKind {
    fn kind(self) -> OperationKind {
        match self {
            Self::Build => OperationKind::Build,
            Self::Pull => OperationKind::Pull,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListResource {
    Images,
    Containers,
}

impl ListResource {
    fn kind(self) -> ResourceKind {
        match self {
            Self::Images => ResourceKind::Images,
            Self::Containers => ResourceKind::Containers,
        }
    }
}

fn release_tag() -> String {
    if let Some(tag) = option_env!("OPWATCH_BUILD_TAG") {
        let trimmed = tag.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version || matches!(cli.command, Some(Commands::Version)) {
        println!("{}", release_tag());
        return ExitCode::from(EXIT_OK);
    }
    let Some(command) = cli.command.as_ref() else {
        eprintln!("missing command; run `opwatch help` for usage");
        return ExitCode::from(EXIT_ERROR);
    };

    let filter =
        EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli, command).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("command-failed code={} error={err}", err.code());
            eprintln!("error: {err}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, EngineError> {
    Ok(apply_flags(cli, EngineConfig::from_env()?))
}

/// Command-line flags win over the environment.
fn apply_flags(cli: &Cli, mut config: EngineConfig) -> EngineConfig {
    if let Some(base_url) = cli.base_url.as_ref() {
        config.base_url = base_url.clone();
    }
    if let Some(prefix) = cli.prefix.as_ref() {
        config.resource_prefix = prefix.trim().trim_matches('/').to_string();
    }
    if let Some(token) = cli.token.as_ref() {
        config.token = Some(token.clone());
    }
    if let Some(db_url) = cli.db_url.as_ref() {
        config.db_url = Some(db_url.clone());
    }
    if cli.no_verify {
        config.verify_failed_targets = false;
    }
    config
}

async fn open_engine(config: EngineConfig) -> Result<Engine, EngineError> {
    let mut builder = Engine::builder(config.clone());
    if let Some(url) = config.db_url.as_deref() {
        builder = builder.journal(OperationJournal::open(url).await?);
    }
    builder.build()
}

async fn run(cli: &Cli, command: &Commands) -> Result<u8, EngineError> {
    let engine = open_engine(load_config(cli)?).await?;
    let code = match command {
        Commands::Build {
            dockerfile,
            image,
            tag,
            detach,
        } => {
            let spec = BuildSpec::new(dockerfile.as_str(), image.as_str(), tag.as_str());
            let id = engine.launch_build(&spec).await?;
            info!("build-launched id={id} target={}", spec.target());
            settle(&engine, &id, *detach).await?
        }
        Commands::Pull { image, detach } => {
            let id = engine.launch_pull(image).await?;
            info!("pull-launched id={id} image={image}");
            settle(&engine, &id, *detach).await?
        }
        Commands::Container {
            action,
            target,
            id,
            payload,
        } => {
            let action = parse_container_action(action)?;
            let payload = parse_payload(payload.as_deref())?;
            let mut target_ref = TargetRef::by_name(target.as_str());
            if let Some(id) = id {
                target_ref = target_ref.with_id(id.as_str());
            }
            let outcome = engine
                .perform_container_action(action, &target_ref, &payload)
                .await?;
            print_json(&json!({
                "id": outcome.id,
                "endpoint": outcome.endpoint.path,
                "record": outcome.record,
                "response": outcome.response,
            }));
            exit_for(&outcome.record)
        }
        Commands::History { follow } => {
            let report = engine.load_history().await;
            for (kind, err) in &report.failures {
                warn!("history-source-failed kind={} error={err}", kind.as_str());
            }
            if *follow {
                for id in &report.resumed {
                    if let Err(err) = engine.wait_until_settled(id).await {
                        warn!("history-follow-stopped id={id} error={err}");
                    }
                }
            }
            print_operations(&engine);
            EXIT_OK
        }
        Commands::Watch { id, kind, target } => {
            let id = OperationId::parse(id);
            engine.track(&id, kind.kind(), target);
            settle(&engine, &id, false).await?
        }
        Commands::Resume => {
            let report = engine.resume_from_journal().await?;
            info!("journal-resumed count={}", report.resumed.len());
            let mut code = EXIT_OK;
            for id in &report.resumed {
                let record = engine.wait_until_settled(id).await?;
                if record.phase == Phase::Failed {
                    code = EXIT_FAILED;
                }
            }
            print_operations(&engine);
            code
        }
        Commands::List { resource } => {
            let items = engine.refresh(resource.kind()).await?;
            print_json(&Value::Array(items));
            EXIT_OK
        }
        Commands::Version => EXIT_OK,
    };
    engine.flush_journal().await;
    engine.shutdown();
    Ok(code)
}

async fn settle(engine: &Engine, id: &OperationId, detach: bool) -> Result<u8, EngineError> {
    if detach {
        print_json(&json!({ "id": id, "record": engine.get_operation(id) }));
        return Ok(EXIT_OK);
    }
    let record = engine.wait_until_settled(id).await?;
    let mut output = json!({ "id": id, "record": record });
    if let Some(report) = engine.failure_report(id) {
        output["failure"] = json!(report);
    }
    print_json(&output);
    Ok(exit_for(&record))
}

fn parse_container_action(raw: &str) -> Result<Action, EngineError> {
    match Action::parse(raw) {
        Some(action) if action.is_container_action() => Ok(action),
        Some(action) => Err(EngineError::Launch(opwatch::LaunchError::UnsupportedAction {
            action: action.as_str(),
        })),
        None => Err(EngineError::Config(opwatch::error::ConfigError::Invalid {
            name: "action",
            value: raw.to_string(),
        })),
    }
}

fn parse_payload(raw: Option<&str>) -> Result<Value, EngineError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(Value::Object(Default::default()));
    };
    serde_json::from_str(raw).map_err(|_| {
        EngineError::Config(opwatch::error::ConfigError::Invalid {
            name: "--payload",
            value: raw.to_string(),
        })
    })
}

fn exit_for(record: &StatusRecord) -> u8 {
    match record.phase {
        Phase::Failed => EXIT_FAILED,
        _ => EXIT_OK,
    }
}

fn print_operations(engine: &Engine) {
    let operations: Vec<Value> = engine
        .operations()
        .into_iter()
        .map(|(id, record)| json!({ "id": id, "record": record }))
        .collect();
    print_json(&Value::Array(operations));
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => warn!("output-encode-failed error={err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_apply_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "opwatch",
            "pull",
            "alpine:3.19",
            "--base-url",
            "http://remote:9000",
            "--no-verify",
        ])
        .unwrap();
        assert_eq!(cli.base_url.as_deref(), Some("http://remote:9000"));
        assert!(cli.no_verify);
        assert!(matches!(
            cli.command,
            Some(Commands::Pull { ref image, detach: false }) if image == "alpine:3.19"
        ));
    }

    #[test]
    fn build_defaults_dockerfile_and_tag() {
        let cli = Cli::try_parse_from(["opwatch", "build", "--image", "App"]).unwrap();
        match cli.command {
            Some(Commands::Build {
                dockerfile, tag, ..
            }) => {
                assert_eq!(dockerfile, "Dockerfile");
                assert_eq!(tag, "latest");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn version_flag_needs_no_subcommand() {
        let cli = Cli::try_parse_from(["opwatch", "--version"]).unwrap();
        assert!(cli.version);
        assert!(cli.command.is_none());
    }

    #[test]
    fn only_container_actions_are_accepted() {
        assert_eq!(parse_container_action("stop").unwrap(), Action::Stop);
        assert!(parse_container_action("build").is_err());
        assert!(parse_container_action("restart").is_err());
    }

    #[test]
    fn payload_must_be_json() {
        assert_eq!(parse_payload(None).unwrap(), json!({}));
        assert_eq!(
            parse_payload(Some(r#"{"image":"nginx"}"#)).unwrap(),
            json!({ "image": "nginx" })
        );
        assert_eq!(parse_payload(Some("{oops")).unwrap_err().code(), "config-invalid");
    }

    #[test]
    fn flags_override_environment_config() {
        let cli = Cli::try_parse_from([
            "opwatch",
            "--prefix",
            "/api/docker/",
            "--token",
            "secret",
            "--no-verify",
            "list",
            "images",
        ])
        .unwrap();
        let env = EngineConfig::from_lookup(|name| match name {
            "OPWATCH_RESOURCE_PREFIX" => Some("svc".to_string()),
            "OPWATCH_TOKEN" => Some("from-env".to_string()),
            "OPWATCH_BASE_URL" => Some("http://daemon:9000".to_string()),
            _ => None,
        })
        .unwrap();
        let config = apply_flags(&cli, env);
        assert_eq!(config.resource_prefix, "api/docker");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.base_url, "http://daemon:9000");
        assert!(!config.verify_failed_targets);
        assert_eq!(config.db_url, None);
    }
}
