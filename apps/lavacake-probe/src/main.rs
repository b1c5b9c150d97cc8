//! LavaCake device probe
//!
//! Negotiates a headless device with the requested queues and capabilities,
//! then logs every examined candidate and the selected adapter.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lavacake-probe -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--graphics <N>`: Graphics queues to request (default: 1)
//! - `--compute <N>`: Compute queues to request (default: 0)
//! - `--ray-tracing[=optional]`: Require ray tracing
//! - `--mesh-shader[=optional]`: Require mesh shading
//! - `--validation`: Enable validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context};
use lavacake_gpu::{CandidateOutcome, Device, Requirement};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeArgs {
    graphics: usize,
    compute: usize,
    ray_tracing: Option<Requirement>,
    mesh_shader: Option<Requirement>,
    validation: bool,
    help: bool,
}

impl Default for ProbeArgs {
    fn default() -> Self {
        Self {
            graphics: 1,
            compute: 0,
            ray_tracing: None,
            mesh_shader: None,
            validation: false,
            help: false,
        }
    }
}

fn requirement(value: Option<&str>, flag: &str) -> anyhow::Result<Requirement> {
    match value {
        None | Some("mandatory") => Ok(Requirement::Mandatory),
        Some("optional") => Ok(Requirement::Optional),
        Some(other) => bail!("invalid value '{other}' for {flag}"),
    }
}

fn parse_args<I>(args: I) -> anyhow::Result<ProbeArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = ProbeArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let (flag, value) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        match flag.as_str() {
            "--graphics" | "--compute" => {
                let count = match value {
                    Some(value) => value,
                    None => args.next().with_context(|| format!("{flag} needs a value"))?,
                };
                let count: usize = count
                    .parse()
                    .with_context(|| format!("invalid queue count '{count}' for {flag}"))?;
                if flag == "--graphics" {
                    parsed.graphics = count;
                } else {
                    parsed.compute = count;
                }
            }
            "--ray-tracing" => parsed.ray_tracing = Some(requirement(value.as_deref(), &flag)?),
            "--mesh-shader" => parsed.mesh_shader = Some(requirement(value.as_deref(), &flag)?),
            "--validation" => parsed.validation = true,
            "-h" | "--help" => parsed.help = true,
            _ => bail!("unknown argument '{flag}'"),
        }
    }

    Ok(parsed)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    let mut builder = Device::builder()
        .app_name("lavacake-probe")
        .validation(args.validation)
        .graphics_queues(args.graphics)
        .compute_queues(args.compute);
    if let Some(requirement) = args.ray_tracing {
        builder = builder.ray_tracing(requirement);
    }
    if let Some(requirement) = args.mesh_shader {
        builder = builder.mesh_shader(requirement);
    }

    let device = builder.build().context("device negotiation failed")?;

    for report in device.selection_report() {
        match &report.outcome {
            CandidateOutcome::Valid => {
                tracing::info!(
                    "[{}] {} (rating {}): selected",
                    report.adapter_index,
                    report.name,
                    report.rating
                );
            }
            outcome => {
                tracing::info!(
                    "[{}] {} (rating {}): {:?}",
                    report.adapter_index,
                    report.name,
                    report.rating,
                    outcome
                );
            }
        }
    }

    tracing::info!("GPU: {}", device.capabilities().summary());
    tracing::info!(
        "Queues: {} graphics, {} compute",
        device.graphics_queues().len(),
        device.compute_queues().len()
    );
    tracing::info!(
        "Ray tracing: {}, mesh shading: {}",
        device.ray_tracing_available(),
        device.mesh_shader_available()
    );

    device.end().context("device teardown failed")?;
    Ok(())
}

fn print_help() {
    eprintln!(
        "LavaCake device probe

USAGE:
    lavacake-probe [OPTIONS]

OPTIONS:
    --graphics <N>            Graphics queues to request (default: 1)
    --compute <N>             Compute queues to request (default: 0)
    --ray-tracing[=optional]  Require ray tracing
    --mesh-shader[=optional]  Require mesh shading
    --validation              Enable validation layers
    -h, --help                Print this help message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ProbeArgs> {
        parse_args(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn defaults() {
        assert_eq!(parse(&[]).unwrap(), ProbeArgs::default());
    }

    #[test]
    fn queue_counts() {
        let args = parse(&["--graphics", "2", "--compute=3"]).unwrap();
        assert_eq!(args.graphics, 2);
        assert_eq!(args.compute, 3);
        assert!(parse(&["--compute"]).is_err());
        assert!(parse(&["--graphics", "x"]).is_err());
    }

    #[test]
    fn capability_requirements() {
        let args = parse(&["--ray-tracing", "--mesh-shader=optional"]).unwrap();
        assert_eq!(args.ray_tracing, Some(Requirement::Mandatory));
        assert_eq!(args.mesh_shader, Some(Requirement::Optional));
        assert!(parse(&["--ray-tracing=maybe"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }
}
