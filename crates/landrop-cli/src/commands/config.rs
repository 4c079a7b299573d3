//! Config command implementation.

use std::time::Duration;

use anyhow::{Context, Result};

use landrop_core::config::{parse_duration, Config, ProbeStrategy};

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    let mut config = Config::load()?;

    match args.action {
        ConfigAction::Get { key } => match get_config_value(&config, &key) {
            Some(v) => println!("{}: {}", key, v),
            None => println!("Unknown configuration key: {}", key),
        },

        ConfigAction::Set { key, value } => {
            if set_config_value(&mut config, &key, &value)? {
                config.save()?;
                println!("Set {} = {}", key, value);
            } else {
                println!("Unknown configuration key: {}", key);
            }
        }

        ConfigAction::Show => {
            let rendered = toml::to_string_pretty(&config).context("cannot render config")?;
            println!();
            println!("Landrop Configuration");
            println!("{}", "─".repeat(50));
            println!();
            println!("{rendered}");
        }

        ConfigAction::Path => println!("{}", Config::config_path().display()),

        ConfigAction::Reset => {
            Config::default().save()?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

fn get_config_value(config: &Config, key: &str) -> Option<String> {
    match key {
        "device_name" => Some(config.general.device_name.clone()),
        "storage_dir" => Some(config.storage_dir().display().to_string()),
        "data_dir" => Some(config.data_dir().display().to_string()),
        "port" => Some(config.network.default_port.to_string()),
        "probe_timeout" => Some(format_duration(config.network.probe_timeout)),
        "probe_strategy" => Some(format!("{:?}", config.network.probe_strategy).to_lowercase()),
        "connect_timeout" => Some(format_duration(config.network.connect_timeout)),
        "heartbeat_interval" => Some(format_duration(config.transfer.heartbeat_interval)),
        "heartbeat_timeout" => Some(format_duration(config.transfer.heartbeat_timeout)),
        "chunk_size" => Some(config.transfer.chunk_size.to_string()),
        "step_timeout" => Some(
            config
                .restore
                .step_timeout
                .map_or_else(|| "off".to_string(), format_duration),
        ),
        "redirect_on_success" => Some(config.restore.redirect_on_success.to_string()),
        _ => None,
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<bool> {
    match key {
        "device_name" => config.general.device_name = value.to_string(),
        "storage_dir" => config.general.storage_dir = Some(value.into()),
        "data_dir" => config.general.data_dir = Some(value.into()),
        "port" => config.network.default_port = value.parse()?,
        "probe_timeout" => config.network.probe_timeout = parse_duration(value)?,
        "probe_strategy" => {
            config.network.probe_strategy = match value {
                "sequential" => ProbeStrategy::Sequential,
                "parallel" => ProbeStrategy::Parallel,
                _ => anyhow::bail!("probe_strategy must be 'sequential' or 'parallel'"),
            }
        }
        "connect_timeout" => config.network.connect_timeout = parse_duration(value)?,
        "heartbeat_interval" => config.transfer.heartbeat_interval = parse_duration(value)?,
        "heartbeat_timeout" => config.transfer.heartbeat_timeout = parse_duration(value)?,
        "chunk_size" => config.transfer.chunk_size = value.parse()?,
        "step_timeout" => {
            config.restore.step_timeout = if value == "off" {
                None
            } else {
                Some(parse_duration(value)?)
            }
        }
        "redirect_on_success" => config.restore.redirect_on_success = value.parse()?,
        _ => return Ok(false),
    }
    Ok(true)
}
