use std::sync::Arc;

use bytemuck::Zeroable;
use pvgpu_core::config::PvgpuConfig;
use pvgpu_core::memory::{IoSpaceMapper, MapError, PagePinner, PinError, PinnedPages};
use pvgpu_core::ops::{adapter, global};
use pvgpu_core::{Adapter, DashMapHandleTable, Process, Session};
use pvgpu_protocol::adapter_commands::{GetInternalAdapterInfoReturn, OpenAdapterReturn, ADAPTER_INFO_ASYNC_MSG};
use pvgpu_protocol::command::{decode_tag, split_message, LAST_COMPATIBLE_INTERFACE_VERSION};
use pvgpu_protocol::global_commands::CreateProcessReturn;
use pvgpu_protocol::handle::encode_wide;
use pvgpu_protocol::pages::{decode_entries, page_runs};
use pvgpu_protocol::status::STATUS_ERRNO_TABLE;
use pvgpu_protocol::{ntstatus_to_errno, CommandTag, D3dkmtHandle, GlobalCommand, NtStatus, VgpuCommand, WinLuid};
use pvgpu_transport::{loopback, HostRequest};
use serde::Serialize;
use tracing::warn;

const LOOPBACK_PROCESS: D3dkmtHandle = D3dkmtHandle(0x4000_0001);
const LOOPBACK_ADAPTER: D3dkmtHandle = D3dkmtHandle(0x4000_0002);
const LOOPBACK_DESCRIPTION: &str = "pvgpu loopback adapter";

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    fn detail(mut self, detail: &str) -> Self {
        self.details.push(detail.to_string());
        self
    }
}

// ── Main entry point ────────────────────────────────────────────────────────

pub fn run_verify(config_path: &str, json: bool) -> anyhow::Result<()> {
    let mut results: Vec<CheckResult> = Vec::new();

    let config = check_config(config_path, &mut results);
    check_status_table(&mut results);
    check_page_list(&config, &mut results);
    check_loopback_session(&config, &mut results);

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results_pretty(&results);
    }

    if results.iter().any(|r| matches!(r.status, CheckStatus::Fail)) {
        std::process::exit(1);
    }

    Ok(())
}

// ── Check 1: Configuration ──────────────────────────────────────────────────

fn check_config(config_path: &str, results: &mut Vec<CheckResult>) -> PvgpuConfig {
    if !std::path::Path::new(config_path).exists() {
        results.push(
            CheckResult::warn("Configuration", &format!("Config file not found: {}", config_path))
                .detail("Using default configuration"),
        );
        return PvgpuConfig::default();
    }

    match PvgpuConfig::load(config_path) {
        Ok(config) => {
            let result = CheckResult::pass("Configuration", &format!("Loaded from {}", config_path))
                .detail(&format!("Max packet size: {} bytes", config.max_packet_size()))
                .detail(&format!("Page shift: {}", config.memory.page_shift))
                .detail(&format!("Interface version: {}", config.protocol.interface_version))
                .detail(&format!("Map guest pages: {}", config.memory.map_guest_pages));
            results.push(result);
            config
        }
        Err(e) => {
            results.push(CheckResult::fail(
                "Configuration",
                &format!("Failed to parse {}: {}", config_path, e),
            ));
            PvgpuConfig::default()
        }
    }
}

// ── Check 2: Status translation ─────────────────────────────────────────────

fn check_status_table(results: &mut Vec<CheckResult>) {
    let mismatched: Vec<String> = STATUS_ERRNO_TABLE
        .iter()
        .filter(|(status, errno)| !status.is_success() && ntstatus_to_errno(*status) != Err(*errno))
        .map(|(status, errno)| format!("{status} does not map to {errno}"))
        .collect();
    let pending_passes = ntstatus_to_errno(NtStatus::PENDING) == Ok(NtStatus::PENDING.0);

    if mismatched.is_empty() && pending_passes {
        results.push(CheckResult::pass(
            "Status translation",
            &format!("{} mapped codes", STATUS_ERRNO_TABLE.len()),
        ));
        return;
    }
    let mut result = CheckResult::fail("Status translation", "Table lookups disagree");
    for line in &mismatched {
        result = result.detail(line);
    }
    if !pending_passes {
        result = result.detail("STATUS_PENDING is not passed through");
    }
    results.push(result);
}

// ── Check 3: Page-list encoding ─────────────────────────────────────────────

fn check_page_list(config: &PvgpuConfig, results: &mut Vec<CheckResult>) {
    let geometry = match config.page_geometry() {
        Ok(geometry) => geometry,
        Err(e) => {
            results.push(CheckResult::fail("Page list", &e.to_string()));
            return;
        }
    };
    let frames = [0u64, 1, 2, 3, 10, 11, 20];
    let runs = page_runs(&frames, geometry);
    let entries: Vec<u64> = runs.iter().map(|&run| geometry.encode(run)).collect();
    if decode_entries(&entries, geometry) == frames {
        results.push(
            CheckResult::pass("Page list", &format!("{} frames -> {} entries", frames.len(), entries.len()))
                .detail(&format!("Page size: {} bytes", geometry.page_size())),
        );
    } else {
        results.push(CheckResult::fail("Page list", "Encoded entries do not decode to the input frames"));
    }
}

// ── Check 4: Loopback session ───────────────────────────────────────────────

/// Memory collaborator for a process with no guest memory behind it.
struct NoGuestMemory;

impl PagePinner for NoGuestMemory {
    fn pin_user_pages(&self, user_va: u64, _page_count: usize, _writable: bool) -> Result<PinnedPages, PinError> {
        Err(PinError::Unmapped(user_va))
    }

    fn unpin_user_pages(&self, _pages: PinnedPages) {}
}

impl IoSpaceMapper for NoGuestMemory {
    fn map(&self, _phys: u64, _size: u64, _writable: bool, _cached: bool) -> Result<u64, MapError> {
        Err(MapError::Failed("loopback process has no address space".to_string()))
    }

    fn unmap(&self, _user_va: u64, _size: u64) -> Result<(), MapError> {
        Ok(())
    }
}

/// Answer the commands a session bring-up issues.
fn loopback_reply(request: &HostRequest, has_ext_header: bool) -> Vec<u8> {
    let tag = split_message(&request.payload, has_ext_header).and_then(|(_, payload)| decode_tag(payload));
    match tag {
        Ok(CommandTag::Global(GlobalCommand::CreateProcess)) => {
            bytemuck::bytes_of(&CreateProcessReturn { hprocess: LOOPBACK_PROCESS }).to_vec()
        }
        Ok(CommandTag::Vgpu { command: VgpuCommand::OpenAdapter, .. }) => bytemuck::bytes_of(&OpenAdapterReturn {
            host_adapter_handle: LOOPBACK_ADAPTER,
            status: NtStatus::SUCCESS,
            vmbus_interface_version: pvgpu_protocol::command::INTERFACE_VERSION,
            vmbus_last_compatible_interface_version: LAST_COMPATIBLE_INTERFACE_VERSION,
        })
        .to_vec(),
        Ok(CommandTag::Vgpu { command: VgpuCommand::GetInternalAdapterInfo, .. }) => {
            let mut info = GetInternalAdapterInfoReturn::zeroed();
            info.flags = ADAPTER_INFO_ASYNC_MSG;
            info.host_adapter_luid = WinLuid { low: 0x1000, high: 0 };
            info.host_vgpu_luid = WinLuid { low: 0x2000, high: 0 };
            info.device_description = encode_wide(LOOPBACK_DESCRIPTION);
            let mut reply = bytemuck::bytes_of(&info).to_vec();
            if !has_ext_header {
                reply.truncate(reply.len() - std::mem::size_of::<WinLuid>());
            }
            reply
        }
        Ok(_) => bytemuck::bytes_of(&NtStatus::SUCCESS).to_vec(),
        Err(e) => {
            warn!("loopback host rejected request {}: {e}", request.request_id);
            bytemuck::bytes_of(&NtStatus::INVALID_PARAMETER).to_vec()
        }
    }
}

fn check_loopback_session(config: &PvgpuConfig, results: &mut Vec<CheckResult>) {
    match run_loopback_session(config) {
        Ok(details) => {
            let mut result = CheckResult::pass("Loopback session", "Process and adapter bring-up succeeded");
            for line in &details {
                result = result.detail(line);
            }
            results.push(result);
        }
        Err(e) => results.push(CheckResult::fail("Loopback session", &e.to_string())),
    }
}

fn run_loopback_session(config: &PvgpuConfig) -> anyhow::Result<Vec<String>> {
    let has_ext_header = config.protocol.interface_version >= pvgpu_protocol::command::INTERFACE_VERSION;

    let (global_channel, global_host) = loopback(config.sync_timeout());
    let (adapter_channel, adapter_host) = loopback(config.sync_timeout());
    let global_server = global_host.serve(move |req| loopback_reply(req, has_ext_header));
    let adapter_server = adapter_host.serve(move |req| loopback_reply(req, has_ext_header));

    let details = {
        let session = Session::from_config(config.clone(), Arc::new(global_channel))?;
        let mut adapter = Adapter::new("loopback", WinLuid { low: 1, high: 0 }, Arc::new(adapter_channel));
        let memory = Arc::new(NoGuestMemory);
        let mut process = Process::new(
            std::process::id(),
            "pvgpu-verify",
            Arc::new(DashMapHandleTable::new()),
            memory.clone(),
            memory,
        );

        global::create_process(&session, &mut process)?;
        adapter::open_adapter(&session, &mut adapter)?;
        let info = adapter::get_internal_adapter_info(&session, &mut adapter)?;
        global::destroy_process(&session, process.host_handle())?;

        vec![
            format!("Interface version: {}", session.vmbus_version()),
            format!("Extended header: {}", session.uses_ext_header()),
            format!("Host process: {}", process.host_handle()),
            format!("Host adapter: {}", adapter.host_handle()),
            format!("Description: {}", adapter.device_description()),
            format!("Async messages: {}", info.async_msg_enabled),
        ]
    };

    // Dropping the session closed both channels, which stops the servers.
    let _ = global_server.join();
    let _ = adapter_server.join();
    Ok(details)
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_results_pretty(results: &[CheckResult]) {
    let mut pass_count = 0u32;
    let mut fail_count = 0u32;
    let mut warn_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Warn => {
                warn_count += 1;
                ("[WARN]", "\x1b[33m", "\x1b[0m")
            }
        };

        println!(
            "  {}{}{} {} - {}",
            color_start, icon, color_end, result.name, result.message
        );

        for detail in &result.details {
            println!("         {}", detail);
        }
        println!();
    }

    println!("-------------------------------");
    println!(
        "  {} passed, {} failed, {} warnings",
        pass_count, fail_count, warn_count
    );
    println!();
}
