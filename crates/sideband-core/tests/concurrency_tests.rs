//! 并发测试
//!
//! 验证排他锁下的计数检查：并发挂载只执行一次创建协议，并发拆除只销毁一次，
//! 查询在挂载和拆除过程中看到的总是一致快照。

use sideband_core::transport::MemoryTransport;
use sideband_core::{
    CompletionStatus, FixedSerial, HostEvents, InstanceHandle, SidebandConfig, SidebandContext,
    TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn setup() -> (Arc<SidebandContext>, MemoryTransport) {
    let transport = MemoryTransport::new();
    let ctx = SidebandContext::new(SidebandConfig::default(), Arc::new(transport.clone()))
        .expect("default config should be valid");
    (Arc::new(ctx), transport)
}

/// 两个实例从零同时出现：只执行一次创建协议
#[test]
fn test_concurrent_first_attach_creates_once() {
    for _ in 0..50 {
        let (ctx, _transport) = setup();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (1..=2u64)
            .map(|i| {
                let ctx = ctx.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ctx.on_instance_appears(InstanceHandle::new(i), &FixedSerial(Some(i as u32)))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ctx.instance_count(), 2);
        assert!(ctx.channel_exists());
        assert_eq!(ctx.metrics().channel_creations, 1);
    }
}

/// 大量实例并发挂载后并发拆除：恰好一次创建、一次销毁
#[test]
fn test_concurrent_attach_detach_fleet() {
    let (ctx, transport) = setup();
    let fleet = 16u64;
    let barrier = Arc::new(Barrier::new(fleet as usize));

    let workers: Vec<_> = (1..=fleet)
        .map(|i| {
            let ctx = ctx.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let handle = InstanceHandle::new(i);
                barrier.wait();
                ctx.on_instance_appears(handle, &FixedSerial(Some(i as u32 * 10)))
                    .unwrap();
                barrier.wait();
                ctx.on_instance_disappears(handle).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ctx.instance_count(), 0);
    assert!(!ctx.channel_exists());
    assert!(!transport.is_bound("toaster_filter.sock"));

    let metrics = ctx.metrics();
    assert_eq!(metrics.channel_creations, 1);
    assert_eq!(metrics.channel_destructions, 1);
}

/// 拆除过程中的查询只会看到一致快照，通道销毁后报告不可达
#[test]
fn test_queries_during_teardown_are_consistent() {
    let (ctx, transport) = setup();
    let fleet = 8u64;
    for i in 1..=fleet {
        ctx.on_instance_appears(InstanceHandle::new(i), &FixedSerial(Some(i as u32)))
            .unwrap();
    }

    let querier = {
        let client = transport.connect("ToasterFilter");
        thread::spawn(move || {
            loop {
                match client.enumerate() {
                    Ok(response) if response.status == CompletionStatus::Success => {
                        let serials = response.serial_numbers();
                        // 按顺序拆除，所以剩下的总是连续的后缀（销毁期间排队的请求可能看到空表）
                        if let Some(Some(first)) = serials.first().copied() {
                            let expected: Vec<Option<u32>> =
                                (first..=fleet as u32).map(Some).collect();
                            assert_eq!(serials, expected);
                        }
                    },
                    Ok(_) => {},
                    Err(TransportError::Unreachable(_)) => break,
                    Err(TransportError::QueueClosed) => {},
                    Err(e) => panic!("unexpected transport error: {e}"),
                }
            }
        })
    };

    for i in 1..=fleet {
        ctx.on_instance_disappears(InstanceHandle::new(i)).unwrap();
        thread::yield_now();
    }

    querier.join().unwrap();
    assert!(!ctx.channel_exists());
}

/// 挂载过程中的查询只会看到注册顺序的前缀
#[test]
fn test_queries_during_attach_see_registration_prefix() {
    let (ctx, transport) = setup();
    let fleet = 8u32;
    let done = Arc::new(AtomicBool::new(false));

    let querier = {
        let client = transport.connect("ToasterFilter");
        let done = done.clone();
        thread::spawn(move || {
            let mut longest = 0usize;
            while !done.load(Ordering::Acquire) {
                match client.enumerate() {
                    Ok(response) if response.status == CompletionStatus::Success => {
                        let serials = response.serial_numbers();
                        let expected: Vec<Option<u32>> =
                            (1..=serials.len() as u32).map(Some).collect();
                        assert_eq!(serials, expected);
                        // 前缀只增不减
                        assert!(serials.len() >= longest);
                        longest = serials.len();
                    },
                    Ok(response) => panic!("unexpected status: {:?}", response.status),
                    // 第一个实例挂载前通道不存在，或别名已发布但尚未开始接受请求
                    Err(TransportError::Unreachable(_)) | Err(TransportError::NotAccepting) => {},
                    Err(e) => panic!("unexpected transport error: {e}"),
                }
            }
        })
    };

    for i in 1..=fleet {
        ctx.on_instance_appears(InstanceHandle::new(i as u64), &FixedSerial(Some(i)))
            .unwrap();
        thread::yield_now();
    }
    done.store(true, Ordering::Release);
    querier.join().unwrap();

    let response = transport.connect("ToasterFilter").enumerate().unwrap();
    assert_eq!(
        response.serial_numbers(),
        (1..=fleet).map(Some).collect::<Vec<_>>()
    );
}

/// 注册表计数和通道存在性在每个静止点都满足：count > 0 ⇔ 通道存在
#[test]
fn test_quiescent_invariant_holds() {
    let (ctx, _transport) = setup();
    let steps: [(u64, bool); 8] = [
        (1, true),
        (2, true),
        (3, true),
        (2, false),
        (1, false),
        (4, true),
        (3, false),
        (4, false),
    ];

    for (raw, attach) in steps {
        let handle = InstanceHandle::new(raw);
        if attach {
            ctx.on_instance_appears(handle, &FixedSerial(Some(raw as u32)))
                .unwrap();
        } else {
            ctx.on_instance_disappears(handle).unwrap();
        }
        assert_eq!(ctx.instance_count() > 0, ctx.channel_exists());
    }
}
