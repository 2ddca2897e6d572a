//! `switchyard status` -- show configuration and worker status.

use comfy_table::{Table, presets::UTF8_FULL};
use switchyard_types::Config;
use switchyard_types::config::loader::{CONFIG_ENV, discover_config_path};

use super::build_engine;

pub async fn run(config: Config) -> anyhow::Result<()> {
    println!("switchyard status");
    println!("=================");
    println!();
    match discover_config_path(dirs::home_dir()) {
        Some(path) => println!("Config: {}", path.display()),
        None => {
            println!("Config: not found, using defaults");
            println!("  Set {CONFIG_ENV} to override");
        }
    }
    println!(
        "Provider: {} ({}), default model {}",
        config.provider.name, config.provider.base_url, config.provider.default_model
    );
    let keys: Vec<String> = config
        .provider
        .api_key_envs
        .iter()
        .map(|env| {
            let state = if std::env::var(env).is_ok() { "set" } else { "missing" };
            format!("{env} ({state})")
        })
        .collect();
    println!("Credentials: {}", keys.join(", "));
    println!(
        "Router: threshold {:.2} in [{:.2}, {:.2}], fan-out {}, default '{}'",
        config.router.threshold,
        config.router.min_threshold,
        config.router.max_threshold,
        config.router.max_fanout,
        config.router.default_worker
    );
    println!();

    let roster = config.effective_workers();
    let engine = build_engine(config).await?;
    let status = engine.status();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Worker", "Kind", "Priority", "Class", "Timeout", "Circuit"]);
    for worker in &roster {
        let registered = status.workers.contains(&worker.id);
        let circuit = status
            .circuits
            .iter()
            .find(|(id, _)| *id == worker.id)
            .map(|(_, c)| format!("{:?}", c.phase))
            .unwrap_or_else(|| "-".into());
        let timeout = worker
            .timeout_secs
            .unwrap_or(engine.config().dispatch.worker_timeout_secs);
        table.add_row(vec![
            if registered { worker.id.clone() } else { format!("{} (unregistered)", worker.id) },
            worker.kind.clone(),
            worker.priority.to_string(),
            worker.resource_class.clone(),
            format!("{timeout}s"),
            circuit,
        ]);
    }
    println!("{table}");

    if let Some(cache) = &status.cache {
        println!(
            "Cache: {} entries, {} hits, {} misses ({:.0}% hit rate)",
            cache.entries,
            cache.hits,
            cache.misses,
            cache.hit_rate * 100.0
        );
    }
    println!(
        "Global rate limits: {} recent, cooldown {}ms",
        status.global.recent_failures, status.global.cooldown_remaining_ms
    );
    Ok(())
}
