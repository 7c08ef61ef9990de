//! Integration test: wire codecs
//!
//! Status translation, page-list encoding, command tags and payload
//! sections, without any transport.
//!
//! Run with: cargo test -p pvgpu-protocol --test wire_test -- --nocapture

use pvgpu_protocol::command::{decode_tag, split_message, EXT_HEADER_SIZE};
use pvgpu_protocol::pages::{decode_entries, page_runs};
use pvgpu_protocol::status::STATUS_ERRNO_TABLE;
use pvgpu_protocol::*;

#[test]
fn test_status_table_entries_map_to_their_errno() {
    for (status, errno) in STATUS_ERRNO_TABLE.iter().filter(|(s, _)| !s.is_success()) {
        assert_eq!(ntstatus_to_errno(*status), Err(*errno), "{status}");
    }
    println!("{} mapped status codes", STATUS_ERRNO_TABLE.len());
}

#[test]
fn test_status_fallbacks() {
    assert_eq!(ntstatus_to_errno(NtStatus::SUCCESS), Ok(0));
    assert_eq!(ntstatus_to_errno(NtStatus::PENDING), Ok(0x103));
    // Unmapped failure
    assert_eq!(ntstatus_to_errno(NtStatus(0xC000_0099_u32 as i32)), Err(Errno::InvalidArgument));
    // Unmapped informational code passes through
    assert_eq!(ntstatus_to_errno(NtStatus(0x4000_0000)), Ok(0x4000_0000));
    assert_eq!(Errno::TryAgain.to_negative(), -11);
}

#[test]
fn test_success_codes_pass_through_before_the_table() {
    // TIMEOUT has a table entry but is a success code, so a wait that
    // times out on the host reports 258 rather than failing.
    assert!(NtStatus::TIMEOUT.is_success());
    assert_eq!(ntstatus_to_errno(NtStatus::TIMEOUT), Ok(0x102));
    assert_eq!(NtStatus::TIMEOUT.into_result(), Ok(258));
}

#[test]
fn test_page_runs_merge_contiguous_frames() {
    let geometry = PageGeometry::X86_4K;
    let frames = [0u64, 1, 2, 3, 10, 11, 20];
    let runs = page_runs(&frames, geometry);

    assert_eq!(
        runs,
        vec![
            PageRun { base_pfn: 0, count: 4 },
            PageRun { base_pfn: 10, count: 2 },
            PageRun { base_pfn: 20, count: 1 },
        ]
    );
    let entries: Vec<u64> = runs.iter().map(|&r| geometry.encode(r)).collect();
    assert_eq!(entries, vec![3, (10 << 12) | 1, 20 << 12]);
    assert_eq!(decode_entries(&entries, geometry), frames);
}

#[test]
fn test_page_runs_split_at_run_limit() {
    let geometry = PageGeometry::X86_4K;
    let frames: Vec<u64> = (100..100 + 4097).collect();
    let runs = page_runs(&frames, geometry);

    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0], PageRun { base_pfn: 100, count: 4096 });
    assert_eq!(runs[1], PageRun { base_pfn: 4196, count: 1 });
    assert_eq!(geometry.encode(runs[0]) & 0xfff, 0xfff);
}

#[test]
fn test_page_geometry_bounds() {
    assert!(PageGeometry::new(11).is_none());
    assert!(PageGeometry::new(22).is_none());
    let g = PageGeometry::new(16).unwrap();
    assert_eq!(g.page_size(), 65536);
    assert_eq!(g.pages_for(1), 1);
    assert_eq!(g.pages_for(65536), 1);
    assert_eq!(g.pages_for(65537), 2);
    assert!(page_runs(&[], g).is_empty());
}

#[test]
fn test_decode_tag_for_both_header_kinds() {
    let global = VmToHostHeader::new(GlobalCommand::SetIoSpaceRegion, D3dkmtHandle::NULL);
    match decode_tag(bytemuck::bytes_of(&global)) {
        Ok(CommandTag::Global(GlobalCommand::SetIoSpaceRegion)) => {}
        other => panic!("expected Global(SetIoSpaceRegion), got {:?}", other),
    }

    let mut vgpu = VgpuToHostHeader::new(VgpuCommand::SignalSyncObject, D3dkmtHandle(7));
    vgpu.set_async();
    match decode_tag(bytemuck::bytes_of(&vgpu)) {
        Ok(CommandTag::Vgpu { command: VgpuCommand::SignalSyncObject, is_async: true }) => {}
        other => panic!("expected async SignalSyncObject, got {:?}", other),
    }

    match decode_tag(&[0u8; 8]) {
        Err(ProtocolError::Truncated { needed: 13, got: 8 }) => {}
        other => panic!("expected Truncated, got {:?}", other),
    }
}

#[test]
fn test_decode_tag_rejects_unknown_values() {
    let mut hdr = VgpuToHostHeader::new(VgpuCommand::CreateDevice, D3dkmtHandle::NULL);
    hdr.command_type = 3;
    match decode_tag(bytemuck::bytes_of(&hdr)) {
        Err(ProtocolError::UnknownCommand(3)) => {}
        other => panic!("expected UnknownCommand(3), got {:?}", other),
    }

    hdr.channel_flags = 5;
    match decode_tag(bytemuck::bytes_of(&hdr)) {
        Err(ProtocolError::UnknownChannel(5)) => {}
        other => panic!("expected UnknownChannel(5), got {:?}", other),
    }
}

#[test]
fn test_split_message_honours_command_offset() {
    let ext = ExtHeader { command_offset: EXT_HEADER_SIZE as u32, reserved: 0, vgpu_luid: WinLuid { low: 9, high: 0 } };
    let cmd = VgpuToHostHeader::new(VgpuCommand::Escape, D3dkmtHandle(1));
    let mut message = bytemuck::bytes_of(&ext).to_vec();
    message.extend_from_slice(bytemuck::bytes_of(&cmd));

    let (parsed, payload) = split_message(&message, true).unwrap();
    assert_eq!(parsed.map(|e| e.vgpu_luid), Some(WinLuid { low: 9, high: 0 }));
    assert_eq!(payload.len(), std::mem::size_of::<VgpuToHostHeader>());

    let (none, whole) = split_message(&message, false).unwrap();
    assert!(none.is_none());
    assert_eq!(whole.len(), message.len());

    let bad = ExtHeader { command_offset: 4, ..ext };
    match split_message(bytemuck::bytes_of(&bad), true) {
        Err(ProtocolError::BadCommandOffset(4)) => {}
        other => panic!("expected BadCommandOffset, got {:?}", other),
    }
}

#[test]
fn test_payload_sections_are_ordered_and_bounded() {
    let mut buf = [0u8; 16];
    let mut w = PayloadWriter::new(&mut buf);
    w.put(&7u32).unwrap();
    w.put_slice(&[D3dkmtHandle(1), D3dkmtHandle(2)]).unwrap();
    assert_eq!(w.remaining(), 4);
    match w.put(&0u64) {
        Err(WireError::Overrun { needed: 8, remaining: 4 }) => {}
        other => panic!("expected Overrun, got {:?}", other),
    }
    w.put_bytes(&[0xaa; 4]).unwrap();

    let mut r = PayloadReader::new(&buf);
    assert_eq!(r.read::<u32>().unwrap(), 7);
    assert_eq!(r.read_vec::<D3dkmtHandle>(2).unwrap(), vec![D3dkmtHandle(1), D3dkmtHandle(2)]);
    assert_eq!(r.read_bytes(4).unwrap(), &[0xaa; 4]);
    match r.read::<u32>() {
        Err(WireError::Truncated { needed: 4, remaining: 0 }) => {}
        other => panic!("expected Truncated, got {:?}", other),
    }
}

#[test]
fn test_wide_strings_truncate_with_terminator() {
    let field: [u16; 4] = handle::encode_wide("abcdef");
    assert_eq!(field[3], 0);
    assert_eq!(handle::decode_wide(&field), "abc");
}
