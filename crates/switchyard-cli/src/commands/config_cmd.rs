//! `switchyard config show` -- print the resolved configuration.

use switchyard_types::Config;

pub fn show(config: &Config) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
