//! Integration test: request framing
//!
//! Message sizing and storage, the extended header, channel routing and
//! the payload codecs that size variable sections.
//!
//! Run with: cargo test -p pvgpu-core --test framing_test -- --nocapture

mod common;

use common::{FakeHost, Harness, VGPU_LUID};
use pvgpu_core::codec::{total_private_size, wire_u32};
use pvgpu_core::config::PvgpuConfig;
use pvgpu_core::message::{select_result_route, select_route, INLINE_MESSAGE_CAPACITY};
use pvgpu_core::rle::{rle_capacity, RleEncoder};
use pvgpu_core::{CoreError, Message, MessageWithResult, Route, Session};
use pvgpu_protocol::command::{ExtHeader, EXT_HEADER_SIZE};
use pvgpu_protocol::pages::PAGE_ENTRY_SIZE;
use pvgpu_protocol::{Errno, PageGeometry, MAX_PACKET_SIZE};

fn bare_session(version: u32) -> Session {
    let host = FakeHost::new("global", version >= 40);
    Session::new(PvgpuConfig::default(), version, host).unwrap()
}

#[test]
fn test_oversized_message_is_rejected_with_overflow() {
    let session = bare_session(40);
    match Message::new(&session, None, MAX_PACKET_SIZE) {
        Err(e) => {
            println!("rejected: {e}");
            assert_eq!(e.errno(), Errno::ValueTooLarge);
            match e {
                CoreError::MessageTooLarge { size, max } => {
                    assert_eq!(size, MAX_PACKET_SIZE + EXT_HEADER_SIZE);
                    assert_eq!(max, MAX_PACKET_SIZE);
                }
                other => panic!("expected MessageTooLarge, got {:?}", other),
            }
        }
        Ok(_) => panic!("expected MessageTooLarge, got a message"),
    }

    // Without the extended header the full packet fits.
    let session = bare_session(39);
    let msg = Message::new(&session, None, MAX_PACKET_SIZE).unwrap();
    assert_eq!(msg.len(), MAX_PACKET_SIZE);
}

#[test]
fn test_ext_header_names_offset_and_vgpu() {
    let h = Harness::new();
    let msg = Message::new(&h.session, Some(&h.adapter), 24).unwrap();
    assert_eq!(msg.len(), 24 + EXT_HEADER_SIZE);
    assert_eq!(msg.payload().len(), 24);

    let ext: ExtHeader = bytemuck::pod_read_unaligned(&msg.as_bytes()[..EXT_HEADER_SIZE]);
    assert_eq!(ext.command_offset as usize, EXT_HEADER_SIZE);
    assert_eq!(ext.vgpu_luid, VGPU_LUID);

    // VM-wide messages carry a zero LUID.
    let msg = Message::new(&h.session, None, 8).unwrap();
    let ext: ExtHeader = bytemuck::pod_read_unaligned(&msg.as_bytes()[..EXT_HEADER_SIZE]);
    assert_eq!(ext.vgpu_luid, Default::default());
}

#[test]
fn test_pre_extension_messages_have_no_prefix() {
    let h = Harness::builder().version(39).build();
    let msg = Message::new(&h.session, Some(&h.adapter), 24).unwrap();
    assert_eq!(msg.len(), 24);
    assert_eq!(msg.payload().len(), msg.as_bytes().len());
}

#[test]
fn test_small_messages_are_stored_inline() {
    let session = bare_session(40);
    let small = Message::new(&session, None, INLINE_MESSAGE_CAPACITY - EXT_HEADER_SIZE).unwrap();
    assert!(small.is_inline());
    assert!(small.payload().iter().all(|&b| b == 0));

    let large = Message::new(&session, None, INLINE_MESSAGE_CAPACITY).unwrap();
    assert!(!large.is_inline());
}

#[test]
fn test_result_messages_are_never_inline() {
    let h = Harness::new();
    let msg = MessageWithResult::new(&h.session, &h.adapter, 8, 13).unwrap();
    assert!(!msg.message().is_inline());
    assert_eq!(msg.result().len(), 16);

    match MessageWithResult::new(&h.session, &h.adapter, 8, MAX_PACKET_SIZE + 1) {
        Err(CoreError::MessageTooLarge { .. }) => {}
        Err(other) => panic!("expected MessageTooLarge, got {:?}", other),
        Ok(_) => panic!("expected MessageTooLarge, got a message"),
    }
}

#[test]
fn test_route_selection() {
    assert_eq!(select_route(true, false), Route::Adapter);
    assert_eq!(select_route(true, true), Route::Global);
    assert_eq!(select_route(false, false), Route::Global);
    assert_eq!(select_route(false, true), Route::Global);
    assert_eq!(select_result_route(false), Route::Adapter);
    assert_eq!(select_result_route(true), Route::Global);
}

#[test]
fn test_async_session_routes_adapter_messages_globally() {
    let sync = Harness::new();
    assert_eq!(Message::new(&sync.session, Some(&sync.adapter), 8).unwrap().route(), Route::Adapter);

    let h = Harness::builder().async_msg().build();
    assert!(h.session.async_msg_enabled());
    assert_eq!(Message::new(&h.session, Some(&h.adapter), 8).unwrap().route(), Route::Global);
    assert_eq!(
        MessageWithResult::new(&h.session, &h.adapter, 8, 8).unwrap().route(),
        Route::Global
    );
}

#[test]
fn test_free_releases_storage_once() {
    let session = bare_session(40);
    let mut msg = Message::new(&session, None, 256).unwrap();
    msg.free();
    msg.free();
    assert!(msg.is_empty());
    assert!(msg.payload().is_empty());
}

#[test]
fn test_rle_capacity_is_one_entry_per_page() {
    let g = PageGeometry::X86_4K;
    assert_eq!(rle_capacity(&[3 * 4096, 1, 0], g), 4);
}

#[test]
fn test_rle_encoder_refuses_to_overrun_its_region() {
    let g = PageGeometry::X86_4K;
    let mut region = [0u8; 2 * PAGE_ENTRY_SIZE];
    let mut encoder = RleEncoder::new(&mut region, g);
    assert_eq!(encoder.capacity(), 2);

    assert_eq!(encoder.encode(&[0, 1, 2]).unwrap(), 1);
    match encoder.encode(&[10, 20]) {
        Err(e @ CoreError::RleOverflow { capacity: 2 }) => assert_eq!(e.errno(), Errno::ValueTooLarge),
        other => panic!("expected RleOverflow, got {:?}", other),
    }
    assert_eq!(encoder.encoded_len(), 2 * PAGE_ENTRY_SIZE);

    let first = u64::from_ne_bytes(region[..8].try_into().unwrap());
    let second = u64::from_ne_bytes(region[8..].try_into().unwrap());
    assert_eq!(first, 2);
    assert_eq!(second, 10 << 12);
}

#[test]
fn test_private_data_totals_stop_at_packet_limit() {
    let a = [0u8; 60];
    let b = [0u8; 40];
    assert_eq!(total_private_size([&a[..], &b[..4]], 100).unwrap(), 64);
    match total_private_size([&a[..], &b[..]], 100) {
        Err(e @ CoreError::ValueTooLarge { .. }) => assert_eq!(e.errno(), Errno::ValueTooLarge),
        other => panic!("expected ValueTooLarge, got {:?}", other),
    }
    assert!(wire_u32("count", u32::MAX as usize).is_ok());
    assert!(wire_u32("count", u32::MAX as usize + 1).is_err());
}
