//! 实例生命周期与共享通道集成测试
//!
//! 使用进程内传输驱动完整的挂载/拆除流程，从外部调用者的视角验证通道行为。

use sideband_core::transport::MemoryTransport;
use sideband_core::{
    CompletionStatus, CreationStep, FixedSerial, HostEvents, InstanceHandle, InstanceState,
    RegistryConfig, SidebandConfig, SidebandContext, SidebandError, SidebandRequest,
    TransportError,
};
use std::sync::Arc;

const ALIAS: &str = "ToasterFilter";
const ADDRESS: &str = "toaster_filter.sock";

fn setup() -> (SidebandContext, MemoryTransport) {
    setup_with(SidebandConfig::default())
}

fn setup_with(config: SidebandConfig) -> (SidebandContext, MemoryTransport) {
    let transport = MemoryTransport::new();
    let ctx = SidebandContext::new(config, Arc::new(transport.clone()))
        .expect("default config should be valid");
    (ctx, transport)
}

fn query(transport: &MemoryTransport) -> Vec<Option<u32>> {
    let response = transport
        .connect(ALIAS)
        .enumerate()
        .expect("shared channel should be reachable");
    assert_eq!(response.status, CompletionStatus::Success);
    response.serial_numbers()
}

#[test]
fn test_first_instance_creates_channel() {
    let (ctx, transport) = setup();
    assert!(!ctx.channel_exists());

    let a = InstanceHandle::new(1);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();

    assert_eq!(ctx.instance_count(), 1);
    assert!(ctx.channel_exists());
    assert_eq!(ctx.channel_address().as_deref(), Some(ADDRESS));
    assert_eq!(transport.alias_target(ALIAS).as_deref(), Some(ADDRESS));
    assert_eq!(transport.is_exclusive(ADDRESS), Some(false));
    assert_eq!(ctx.instance_state(a), Some(InstanceState::Active));
    assert_eq!(query(&transport), vec![Some(10)]);
}

#[test]
fn test_second_instance_reuses_channel() {
    let (ctx, transport) = setup();
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
        .unwrap();
    ctx.on_instance_appears(InstanceHandle::new(2), &FixedSerial(Some(20)))
        .unwrap();

    assert_eq!(ctx.instance_count(), 2);
    assert!(ctx.channel_exists());
    assert_eq!(ctx.metrics().channel_creations, 1);
    assert_eq!(query(&transport), vec![Some(10), Some(20)]);
}

#[test]
fn test_non_last_removal_keeps_channel() {
    let (ctx, transport) = setup();
    let a = InstanceHandle::new(1);
    let b = InstanceHandle::new(2);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();
    ctx.on_instance_appears(b, &FixedSerial(Some(20))).unwrap();

    ctx.on_instance_disappears(a).unwrap();

    assert_eq!(ctx.instance_count(), 1);
    assert!(ctx.channel_exists());
    assert_eq!(ctx.instance_state(a), None);
    assert_eq!(ctx.metrics().channel_destructions, 0);
    assert_eq!(query(&transport), vec![Some(20)]);
}

#[test]
fn test_last_removal_destroys_channel() {
    let (ctx, transport) = setup();
    let a = InstanceHandle::new(1);
    let b = InstanceHandle::new(2);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();
    ctx.on_instance_appears(b, &FixedSerial(Some(20))).unwrap();
    ctx.on_instance_disappears(a).unwrap();

    ctx.on_instance_disappears(b).unwrap();

    assert_eq!(ctx.instance_count(), 0);
    assert!(!ctx.channel_exists());
    assert!(!transport.is_bound(ADDRESS));
    assert!(transport.alias_target(ALIAS).is_none());
    assert_eq!(ctx.metrics().channel_destructions, 1);

    // 不可达，而不是返回空列表
    let err = transport.connect(ALIAS).enumerate().unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)));
}

#[test]
fn test_alias_failure_rolls_back_and_attach_succeeds() {
    let (ctx, transport) = setup();
    transport.fail_step(CreationStep::PublishAlias);

    let a = InstanceHandle::new(1);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();

    assert_eq!(ctx.instance_count(), 1);
    assert!(!ctx.channel_exists());
    assert!(!transport.is_bound(ADDRESS));
    assert!(transport.alias_target(ALIAS).is_none());
    assert_eq!(ctx.instance_state(a), Some(InstanceState::Active));

    let metrics = ctx.metrics();
    assert_eq!(metrics.channel_creations, 1);
    assert_eq!(metrics.channel_creation_failures, 1);
    assert_eq!(metrics.channels_created(), 0);
}

#[test]
fn test_every_creation_step_rolls_back() {
    for step in [
        CreationStep::BindAddress,
        CreationStep::PublishAlias,
        CreationStep::StartAccepting,
    ] {
        let (ctx, transport) = setup();
        transport.fail_step(step);

        ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
            .unwrap();
        assert!(!ctx.channel_exists(), "step {step}");
        assert!(!transport.is_bound(ADDRESS), "step {step}");

        // 注入的故障是一次性的，重试会成功
        let retried = ctx.channel_manager().ensure_created();
        assert!(matches!(retried, Ok(true)), "step {step}: {retried:?}");
        assert!(ctx.channel_exists(), "step {step}");
        assert_eq!(ctx.metrics().channel_creation_failures, 1, "step {step}");
    }
}

#[test]
fn test_failed_creation_retried_on_next_attach() {
    let (ctx, transport) = setup();
    transport.fail_step(CreationStep::StartAccepting);
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
        .unwrap();
    assert!(!ctx.channel_exists());

    ctx.on_instance_appears(InstanceHandle::new(2), &FixedSerial(Some(20)))
        .unwrap();
    assert!(ctx.channel_exists());
    assert_eq!(query(&transport), vec![Some(10), Some(20)]);
}

#[test]
fn test_ensure_created_reports_failure() {
    let (ctx, transport) = setup();
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
        .unwrap();
    ctx.channel_manager()
        .ensure_destroyed(InstanceHandle::new(1));
    assert!(!ctx.channel_exists());

    transport.fail_step(CreationStep::BindAddress);
    let err = ctx.channel_manager().ensure_created().unwrap_err();
    assert!(matches!(
        err,
        SidebandError::ChannelCreationFailed {
            step: CreationStep::BindAddress,
            ..
        }
    ));
    assert!(!err.is_fatal());
}

#[test]
fn test_ensure_operations_are_idempotent() {
    let (ctx, _transport) = setup();
    let a = InstanceHandle::new(1);
    let manager = ctx.channel_manager();

    // 没有注册实例时不创建
    assert!(!manager.ensure_created().unwrap());
    assert!(!manager.ensure_destroyed(a));

    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();
    assert!(!manager.ensure_created().unwrap());
    assert_eq!(ctx.metrics().channel_creations, 1);

    assert!(manager.ensure_destroyed(a));
    assert!(!manager.ensure_destroyed(a));
    assert_eq!(ctx.metrics().channel_destructions, 1);
}

#[test]
fn test_ensure_destroyed_ignores_non_last_trigger() {
    let (ctx, _transport) = setup();
    let a = InstanceHandle::new(1);
    let b = InstanceHandle::new(2);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();
    ctx.on_instance_appears(b, &FixedSerial(Some(20))).unwrap();

    assert!(!ctx.channel_manager().ensure_destroyed(a));
    assert!(ctx.channel_exists());

    // 未注册的句柄不能触发销毁
    ctx.on_instance_disappears(a).unwrap();
    assert!(!ctx.channel_manager().ensure_destroyed(InstanceHandle::new(99)));
    assert!(ctx.channel_exists());
}

#[test]
fn test_unknown_instance_removal_is_not_found() {
    let (ctx, _transport) = setup();
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
        .unwrap();

    let err = ctx
        .on_instance_disappears(InstanceHandle::new(42))
        .unwrap_err();
    assert!(matches!(err, SidebandError::NotFound(h) if h == InstanceHandle::new(42)));
    assert!(!err.is_fatal());
    assert_eq!(ctx.instance_count(), 1);
    assert!(ctx.channel_exists());
    assert_eq!(ctx.metrics().deregister_not_found, 1);
}

#[test]
fn test_identification_failure_attaches_untagged() {
    let (ctx, transport) = setup();
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(None))
        .unwrap();
    ctx.on_instance_appears(InstanceHandle::new(2), &FixedSerial(Some(20)))
        .unwrap();

    assert_eq!(ctx.metrics().identification_failures, 1);
    assert_eq!(query(&transport), vec![None, Some(20)]);
}

#[test]
fn test_registry_limit_rejects_attach() {
    let config = SidebandConfig {
        registry: RegistryConfig {
            max_instances: Some(1),
        },
        ..Default::default()
    };
    let (ctx, transport) = setup_with(config);
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
        .unwrap();

    let err = ctx
        .on_instance_appears(InstanceHandle::new(2), &FixedSerial(Some(20)))
        .unwrap_err();
    assert!(matches!(err, SidebandError::ResourceExhausted { count: 1 }));
    assert!(err.is_fatal());
    assert_eq!(ctx.instance_state(InstanceHandle::new(2)), None);
    assert_eq!(ctx.metrics().attach_failures, 1);
    assert_eq!(query(&transport), vec![Some(10)]);
}

#[test]
fn test_duplicate_attach_is_rejected() {
    let (ctx, _transport) = setup();
    let a = InstanceHandle::new(1);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();

    let err = ctx.on_instance_appears(a, &FixedSerial(Some(11))).unwrap_err();
    assert!(matches!(err, SidebandError::DuplicateInstance(h) if h == a));
    assert_eq!(ctx.instance_count(), 1);
    assert_eq!(ctx.snapshot()[0].serial_no, Some(10));
}

#[test]
fn test_on_query_routes_through_channel() {
    let (ctx, _transport) = setup();
    let err = ctx
        .on_query(SidebandRequest::EnumerateInstances)
        .unwrap_err();
    assert!(matches!(
        err,
        SidebandError::Transport(TransportError::Unreachable(_))
    ));

    ctx.on_instance_appears(InstanceHandle::new(7), &FixedSerial(Some(70)))
        .unwrap();
    let response = ctx.on_query(SidebandRequest::EnumerateInstances).unwrap();
    assert_eq!(response.serial_numbers(), vec![Some(70)]);
    assert_eq!(response.instances[0].handle, 7);
    assert_eq!(ctx.metrics().queries_dispatched, 1);
}

#[test]
fn test_channel_recreated_after_empty() {
    let (ctx, transport) = setup();
    let a = InstanceHandle::new(1);
    ctx.on_instance_appears(a, &FixedSerial(Some(10))).unwrap();
    ctx.on_instance_disappears(a).unwrap();
    assert!(!ctx.channel_exists());

    let b = InstanceHandle::new(2);
    ctx.on_instance_appears(b, &FixedSerial(Some(20))).unwrap();
    assert!(ctx.channel_exists());
    assert_eq!(query(&transport), vec![Some(20)]);

    let metrics = ctx.metrics();
    assert_eq!(metrics.channels_created(), 2);
    assert_eq!(metrics.channel_destructions, 1);
}

#[test]
fn test_shutdown_detaches_everything() {
    let (ctx, transport) = setup();
    for i in 1..=3 {
        ctx.on_instance_appears(InstanceHandle::new(i), &FixedSerial(Some(i as u32 * 10)))
            .unwrap();
    }

    ctx.shutdown().unwrap();
    assert!(!transport.is_bound(ADDRESS));
    assert!(transport.alias_target(ALIAS).is_none());
}

#[test]
fn test_drop_releases_channel() {
    let (ctx, transport) = setup();
    ctx.on_instance_appears(InstanceHandle::new(1), &FixedSerial(Some(10)))
        .unwrap();
    drop(ctx);
    assert!(!transport.is_bound(ADDRESS));
}
