use anyhow::{bail, Context};
use serde::Serialize;
use skytrust_core::{logging, SupplyChainConfig};
use skytrust_identity::{
    deregister_devices, mint_devices, BulkProgress, CancelSignal, DirectoryTrustStore,
    InMemoryTrustStore, LocalCollaborators, ProgressSnapshot, SupplyChain, TrustStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;
const LOCAL_HUB_NAME: &str = "skytrust-local-hub";

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct NodeArgs {
    config: PathBuf,
    devices: usize,
    export_dir: Option<PathBuf>,
    pop_code: Option<String>,
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    root_subject: String,
    enrollment_ready: bool,
    minted: ProgressSnapshot,
    messages_sent: usize,
    deregistered: ProgressSnapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let args = parse_args(&args)?;
    logging::init_with(args.json_logs);

    let mut config = SupplyChainConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_env();
    config.validate().context("invalid configuration")?;

    let summary = run(&config, &args).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(config: &SupplyChainConfig, args: &NodeArgs) -> anyhow::Result<RunSummary> {
    if config.provisioning.connection_string.is_some() {
        warn!("Remote provisioning collaborators are not available; using local ones");
    }

    let trust_store: Arc<dyn TrustStore> = match &config.trust_store_dir {
        Some(dir) => Arc::new(DirectoryTrustStore::open(dir)?),
        None => Arc::new(InMemoryTrustStore::new()),
    };
    let local = LocalCollaborators::new(&config.provisioning.enrollment_group_id, LOCAL_HUB_NAME);
    let chain = SupplyChain::build(config, local.collaborators(trust_store))?;
    let company = chain.company().clone();

    let removed = chain.clean_trust_store()?;
    info!(removed, organization = %company.organization(), "Trust store cleaned");

    let enrollment_ready = company.clean_up_and_create_enrollment().await?;
    if !enrollment_ready {
        bail!("enrollment {} is not enabled", config.provisioning.enrollment_group_id);
    }

    if let Some(dir) = &args.export_dir {
        export_certificates(&chain, dir, args.pop_code.as_deref())?;
    }

    let cancel = CancelSignal::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping new work");
            ctrl_c.cancel();
        }
    });

    let mint_progress = Arc::new(BulkProgress::new());
    let mut devices = mint_devices(
        company.clone(),
        args.devices,
        &config.provisioning.global_endpoint,
        &config.provisioning.id_scope,
        &config.bulk,
        &cancel,
        mint_progress.clone(),
    )
    .await?;

    let mut messages_sent = 0;
    for device in devices.iter().filter(|device| device.is_ready()) {
        let payload = serde_json::to_vec(&serde_json::json!({
            "device_id": device.device_id(),
            "message": "hello",
        }))?;
        match device.authenticate_and_send(&payload).await {
            Ok(()) => messages_sent += 1,
            Err(e) => warn!(device_id = %device.device_id(), error = %e, "Hello not delivered"),
        }
    }

    let deregister_progress = Arc::new(BulkProgress::new());
    deregister_devices(
        chain.registry(),
        &config.bulk,
        &CancelSignal::new(),
        deregister_progress.clone(),
    )
    .await?;

    for device in devices.iter_mut() {
        device.dispose();
    }
    company.orchestrator().delete().await?;
    let root_subject = company.root_certificate()?.subject().to_string();
    chain.dispose();

    info!("STATUS: SkyTrustNode :: Run complete :: ACTIVE");
    Ok(RunSummary {
        root_subject,
        enrollment_ready,
        minted: mint_progress.snapshot(),
        messages_sent,
        deregistered: deregister_progress.snapshot(),
    })
}

fn export_certificates(chain: &SupplyChain, dir: &Path, pop_code: Option<&str>) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let root_path = dir.join("root-ca.pem");
    std::fs::write(&root_path, chain.company().export_root_pem()?)
        .with_context(|| format!("writing {}", root_path.display()))?;
    info!(path = %root_path.display(), "Root certificate exported");

    if let Some(code) = pop_code {
        check_pop_code(code)?;
        let pop_path = dir.join(format!("verification-{}.pem", code));
        std::fs::write(&pop_path, chain.company().generate_proof_of_possession(code)?)
            .with_context(|| format!("writing {}", pop_path.display()))?;
        info!(path = %pop_path.display(), "Proof-of-possession certificate exported");
    }
    Ok(())
}

/// Verification codes name an output file, so only ASCII alphanumerics pass.
fn check_pop_code(code: &str) -> anyhow::Result<()> {
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("--pop-code must be non-empty and alphanumeric, got {:?}", code);
    }
    Ok(())
}

fn parse_args(args: &[String]) -> anyhow::Result<NodeArgs> {
    let mut config = None;
    let mut devices = 1;
    let mut export_dir = None;
    let mut pop_code = None;
    let mut json_logs = false;

    let mut args_iter = args.iter().skip(1);
    while let Some(arg) = args_iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = args_iter.next().context("--config was provided without a path")?;
                config = Some(PathBuf::from(path));
            }
            "--devices" => {
                let count = args_iter.next().context("--devices was provided without a count")?;
                devices = count
                    .parse()
                    .with_context(|| format!("invalid device count {}", count))?;
            }
            "--export-dir" => {
                let path = args_iter
                    .next()
                    .context("--export-dir was provided without a path")?;
                export_dir = Some(PathBuf::from(path));
            }
            "--pop-code" => {
                let code = args_iter.next().context("--pop-code was provided without a code")?;
                check_pop_code(code)?;
                pop_code = Some(code.clone());
            }
            "--json-logs" => json_logs = true,
            other => bail!("unknown argument {}", other),
        }
    }

    let config = config.context("missing required --config <path> argument")?;
    if pop_code.is_some() && export_dir.is_none() {
        bail!("--pop-code requires --export-dir");
    }
    Ok(NodeArgs {
        config,
        devices,
        export_dir,
        pop_code,
        json_logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("skytrust-node")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_full_args() {
        let args = parse_args(&argv(&[
            "--config",
            "fleet.json",
            "--devices",
            "12",
            "--export-dir",
            "out",
            "--pop-code",
            "ABC123",
            "--json-logs",
        ]))
        .unwrap();
        assert_eq!(
            args,
            NodeArgs {
                config: PathBuf::from("fleet.json"),
                devices: 12,
                export_dir: Some(PathBuf::from("out")),
                pop_code: Some("ABC123".to_string()),
                json_logs: true,
            }
        );
    }

    #[test]
    fn test_config_is_required() {
        let err = parse_args(&argv(&["--devices", "2"])).unwrap_err();
        assert!(err.to_string().contains("--config"));
    }

    #[test]
    fn test_pop_code_needs_export_dir() {
        assert!(parse_args(&argv(&["--config", "c.json", "--pop-code", "X"])).is_err());
    }

    #[test]
    fn test_pop_code_must_be_alphanumeric() {
        for code in ["../evil", "a/b", "CAFE 01", ""] {
            let err = parse_args(&argv(&[
                "--config",
                "c.json",
                "--export-dir",
                "out",
                "--pop-code",
                code,
            ]))
            .unwrap_err();
            assert!(err.to_string().contains("alphanumeric"), "accepted {:?}", code);
        }
        assert!(check_pop_code("CAFE01").is_ok());
    }

    #[test]
    fn test_bad_device_count() {
        assert!(parse_args(&argv(&["--config", "c.json", "--devices", "many"])).is_err());
    }

    #[tokio::test]
    async fn test_run_with_local_collaborators() {
        let mut config = SupplyChainConfig::default();
        config.provisioning.id_scope = "0ne00000001".to_string();
        config.provisioning.enrollment_group_id = "node-test".to_string();
        let export_dir = std::env::temp_dir().join(format!(
            "skytrust-node-{}",
            std::process::id()
        ));
        let args = NodeArgs {
            config: PathBuf::from("unused.json"),
            devices: 3,
            export_dir: Some(export_dir.clone()),
            pop_code: Some("CAFE01".to_string()),
            json_logs: false,
        };

        let summary = run(&config, &args).await.unwrap();
        assert!(summary.enrollment_ready);
        assert_eq!(summary.minted.succeeded, 3);
        assert_eq!(summary.messages_sent, 3);
        assert_eq!(summary.deregistered.succeeded, 3);
        assert!(export_dir.join("root-ca.pem").exists());
        assert!(export_dir.join("verification-CAFE01.pem").exists());

        std::fs::remove_dir_all(&export_dir).ok();
    }
}
