use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use colored::*;
use plugin_runtime_core::{
    load_descriptor, JsonFileSnapshotStore, LifecycleState, PluginConfig, PluginInfo, PluginResult, PluginRuntime,
    RuntimeConfig, SnapshotStore,
};
use tracing::{error, info, warn};

pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
    pub settings: Vec<String>,
    pub duration: Option<u64>,
}

/// Validate every manifest, reporting all failures before returning.
pub async fn validate(manifests: &[PathBuf]) -> anyhow::Result<()> {
    let mut failures = 0usize;
    for path in manifests {
        match load_descriptor(path).await {
            Ok(descriptor) => println!(
                "{} {} {}",
                "✓".bright_green(),
                path.display(),
                descriptor.to_string().bright_white()
            ),
            Err(e) => {
                failures += 1;
                println!("{} {} {}", "✗".bright_red(), path.display(), e.to_string().red());
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} manifests are invalid", manifests.len());
    }
    Ok(())
}

pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    let mut config = RuntimeConfig::load(options.config.as_deref()).context("loading runtime configuration")?;
    if let Some(path) = options.snapshot {
        config.registry.snapshot_path = Some(path);
    }
    let mut settings = parse_settings(&options.settings)?;
    let store = config.registry.snapshot_path.clone().map(JsonFileSnapshotStore::new);

    let runtime = PluginRuntime::new(config);
    info!(runtime_id = %runtime.id(), "{}", "Plugin host starting".bright_cyan());

    if let Some(store) = &store {
        let restored = runtime.load_registry(store).await?;
        if restored > 0 {
            info!(restored, path = %store.path().display(), "Restored catalog entries from snapshot");
        }
    }

    for (descriptor, plugin) in example_plugins::builtin() {
        let plugin_id = descriptor.id.clone();
        runtime
            .register_plugin(descriptor, plugin)
            .await
            .with_context(|| format!("registering {plugin_id}"))?;

        let plugin_config = settings.remove(&plugin_id).unwrap_or_default();
        if let Err(e) = bring_up(&runtime, &plugin_id, plugin_config).await {
            error!(plugin_id = %plugin_id, error = %e, "Plugin failed to start");
        }
    }
    for plugin_id in settings.keys() {
        warn!(plugin_id = %plugin_id, "Settings given for a plugin that is not bundled");
    }

    print_plugins(&runtime.list_plugins().await);

    match options.duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            info!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
    }

    runtime.shutdown().await;
    if let Some(store) = &store {
        runtime.save_registry(store).await?;
        info!(path = %store.path().display(), "Registry snapshot written");
    }
    info!("{}", "Plugin host stopped".bright_cyan());
    Ok(())
}

pub async fn show_snapshot(file: &Path, json: bool) -> anyhow::Result<()> {
    let store = JsonFileSnapshotStore::new(file);
    let Some(snapshot) = store.load().await? else {
        bail!("no snapshot at {}", file.display());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!(
        "{} {} ({} plugins)",
        "Snapshot".bright_cyan(),
        snapshot.timestamp.to_rfc3339().bright_white(),
        snapshot.plugins.len()
    );
    for (plugin_id, descriptor) in &snapshot.plugins {
        let state = snapshot.states.get(plugin_id).copied().unwrap_or(LifecycleState::Unloaded);
        println!("  {:<24} {:<10} {}", plugin_id, descriptor.version, paint(state));
    }
    Ok(())
}

async fn bring_up(runtime: &PluginRuntime, plugin_id: &str, config: PluginConfig) -> PluginResult<()> {
    runtime.initialize(plugin_id, config).await?;
    runtime.start(plugin_id).await
}

/// Group `plugin.key=value` settings by plugin id.
fn parse_settings(settings: &[String]) -> anyhow::Result<BTreeMap<String, PluginConfig>> {
    let mut grouped: BTreeMap<String, PluginConfig> = BTreeMap::new();
    for setting in settings {
        let parsed = setting
            .split_once('=')
            .and_then(|(target, value)| target.split_once('.').map(|(plugin, key)| (plugin, key, value)));
        match parsed {
            Some((plugin, key, value)) if !plugin.is_empty() && !key.is_empty() => {
                grouped
                    .entry(plugin.to_string())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
            _ => bail!("expected PLUGIN.KEY=VALUE, got '{setting}'"),
        }
    }
    Ok(grouped)
}

fn print_plugins(plugins: &[PluginInfo]) {
    println!("{}", "Plugins".bright_cyan());
    for info in plugins {
        let capabilities: Vec<String> = info.descriptor.capabilities.iter().map(ToString::to_string).collect();
        println!(
            "  {:<24} {:<10} {:<12} {}",
            info.descriptor.id,
            info.descriptor.version,
            paint(info.state),
            capabilities.join(",").dimmed()
        );
    }
}

fn paint(state: LifecycleState) -> ColoredString {
    let label = state.to_string();
    match state {
        LifecycleState::Started => label.bright_green(),
        LifecycleState::Error => label.bright_red(),
        LifecycleState::Starting | LifecycleState::Stopping => label.bright_yellow(),
        _ => label.normal(),
    }
}
