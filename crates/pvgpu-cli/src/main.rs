mod verify;

use clap::{Parser, Subcommand};
use pvgpu_core::config::{default_config_path, PvgpuConfig};
use pvgpu_protocol::pages::{decode_entries, page_runs};
use pvgpu_protocol::{ntstatus_to_errno, NtStatus, PageGeometry};
use tracing::info;

#[derive(Parser)]
#[command(name = "pvgpu")]
#[command(about = "pvgpu - paravirtual GPU bus diagnostics")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a host status code into the local error it maps to
    Status {
        /// Status code, decimal or 0x-prefixed hex
        code: String,
    },

    /// Encode page frame numbers into sysmem page-list entries
    Pages {
        /// log2 of the page size
        #[arg(short, long, default_value_t = 12)]
        shift: u32,

        /// Frame numbers, in virtual address order
        #[arg(required = true)]
        pfns: Vec<u64>,
    },

    /// Show the effective configuration
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Run self-checks, including a session against an in-process loopback host
    Verify {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    pvgpu_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status { code } => {
            let status = parse_status(&code)?;
            match ntstatus_to_errno(status) {
                Ok(value) => println!("{status} -> success ({value})"),
                Err(errno) => println!("{status} -> -{} {errno}", errno.code()),
            }
        }

        Commands::Pages { shift, pfns } => {
            let geometry =
                PageGeometry::new(shift).ok_or_else(|| anyhow::anyhow!("unsupported page shift {shift}"))?;
            let runs = page_runs(&pfns, geometry);
            println!("{} frame(s) -> {} entr{}", pfns.len(), runs.len(), if runs.len() == 1 { "y" } else { "ies" });
            let mut entries = Vec::with_capacity(runs.len());
            for run in runs {
                let entry = geometry.encode(run);
                entries.push(entry);
                println!("  {entry:#018x}  pfn {:#x} x {}", run.base_pfn, run.count);
            }
            if decode_entries(&entries, geometry) != pfns {
                anyhow::bail!("encoded page list does not decode back to the input frames");
            }
        }

        Commands::Config { config, json } => {
            let path = config.unwrap_or_else(default_config_path);
            info!("loading configuration from {}", path);
            let config = if std::path::Path::new(&path).exists() {
                PvgpuConfig::load(&path)?
            } else {
                eprintln!("{path} not found, showing defaults");
                PvgpuConfig::default()
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }

        Commands::Verify { config, json } => {
            let path = config.unwrap_or_else(default_config_path);
            verify::run_verify(&path, json)?;
        }
    }

    Ok(())
}

fn parse_status(code: &str) -> anyhow::Result<NtStatus> {
    let code = code.trim();
    let value = match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)? as i32,
        None => code.parse::<i64>().map(|v| v as i32)?,
    };
    Ok(NtStatus(value))
}

