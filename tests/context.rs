use gpu_timeline::{
    BufferUses, CreateContextError, DeviceError, Event, QueryType, QueueKind,
    TimestampCapabilities, MAX_CALLSTACK_DEPTH, QUERY_SIZE,
};

use crate::common::{initialize_test, TestParameters};

#[test]
fn creation_announces_calibration() {
    initialize_test(TestParameters::default().clock(5_000, 1), |ctx| {
        let context = ctx.context();
        assert_eq!(context.capacity(), 64);
        assert_eq!(context.pending(), 0);
        assert_eq!(context.harvested_cursor(), 0);
        assert_eq!(context.label(), "test");
        assert_eq!(context.queue_kind(), QueueKind::Direct);

        let calibration = *context.calibration();
        assert_eq!(calibration.device_time, 5_000);
        assert_eq!(calibration.period, 1.0);
        assert_eq!(
            ctx.profiler.events(),
            [Event::NewContext {
                host_time: calibration.host_time,
                device_time: 5_000,
                thread: 0,
                period: 1.0,
                context: context.id().raw(),
                accuracy_bits: 0,
                queue_kind: QueueKind::Direct,
            }]
        );
    });
}

#[test]
fn period_follows_frequency() {
    initialize_test(TestParameters::default().frequency(1_000_000), |ctx| {
        let context = ctx.context();
        assert_eq!(context.calibration().period, 1000.0);
    });
}

#[test]
fn context_ids_increase() {
    initialize_test(TestParameters::default(), |ctx| {
        let first = ctx.context();
        let second = ctx.context();
        assert!(second.id() > first.id());
    });
}

#[test]
fn copy_queue_needs_capability() {
    let params = TestParameters::default()
        .capabilities(TimestampCapabilities::QUEUE)
        .queue_kind(QueueKind::Copy);
    initialize_test(params, |ctx| {
        assert_eq!(
            ctx.create_context().unwrap_err(),
            CreateContextError::DeviceUnsupported(QueueKind::Copy)
        );
        assert!(ctx.profiler.events().is_empty());
        assert!(ctx.device.query_set_attempts().is_empty());
    });
}

#[test]
fn copy_queue_with_capability() {
    initialize_test(TestParameters::default().queue_kind(QueueKind::Copy), |ctx| {
        let context = ctx.context();
        assert_eq!(context.queue_kind(), QueueKind::Copy);
        assert_eq!(
            ctx.device.created_query_sets(),
            [(QueryType::CopyQueueTimestamp, 64)]
        );
        assert_eq!(
            ctx.device.created_buffers(),
            [(64 * QUERY_SIZE, BufferUses::MAP_READ | BufferUses::COPY_DST)]
        );
        match ctx.profiler.events()[..] {
            [Event::NewContext { queue_kind, .. }] => assert_eq!(queue_kind, QueueKind::Copy),
            ref other => panic!("Unexpected events {:?}", other),
        }
    });
}

#[test]
fn calibration_failure() {
    initialize_test(TestParameters::default(), |ctx| {
        ctx.queue.set_calibration_failure(true);
        assert_eq!(
            ctx.create_context().unwrap_err(),
            CreateContextError::CalibrationFailed(DeviceError::Lost)
        );
        assert!(ctx.profiler.events().is_empty());
        assert_eq!(ctx.device.live_query_sets(), 0);
    });
}

#[test]
fn zero_frequency_is_rejected() {
    initialize_test(TestParameters::default().frequency(0), |ctx| {
        assert_eq!(
            ctx.create_context().unwrap_err(),
            CreateContextError::InvalidFrequency(0)
        );
    });
}

#[test]
fn capacity_is_halved_until_the_device_accepts() {
    let params = TestParameters::default()
        .query_capacity(1000)
        .max_query_count(4);
    initialize_test(params, |ctx| {
        let context = ctx.context();
        assert_eq!(context.capacity(), 4);
        assert_eq!(
            ctx.device.query_set_attempts(),
            [1000, 500, 250, 125, 63, 32, 16, 8, 4]
        );
        assert_eq!(
            ctx.device.created_query_sets(),
            [(QueryType::Timestamp, 4)]
        );
        assert_eq!(
            ctx.device.created_buffers(),
            [(4 * QUERY_SIZE, BufferUses::MAP_READ | BufferUses::COPY_DST)]
        );
    });
}

#[test]
fn query_set_creation_failure() {
    let params = TestParameters::default()
        .query_capacity(8)
        .max_query_count(1);
    initialize_test(params, |ctx| {
        assert_eq!(
            ctx.create_context().unwrap_err(),
            CreateContextError::QuerySetCreation { requested: 8 }
        );
        assert_eq!(ctx.device.query_set_attempts(), [8, 4, 2]);
        assert_eq!(ctx.device.live_query_sets(), 0);
        assert_eq!(ctx.device.live_buffers(), 0);
    });
}

#[test]
fn callstack_depth_is_clamped() {
    initialize_test(TestParameters::default().callstack_depth(200), |ctx| {
        let context = ctx.context();
        assert_eq!(usize::from(context.callstack_depth()), MAX_CALLSTACK_DEPTH);
    });
}

#[test]
fn drop_releases_resources() {
    initialize_test(TestParameters::default(), |ctx| {
        let context = ctx.context();
        assert_eq!(ctx.device.live_query_sets(), 1);
        assert_eq!(ctx.device.live_buffers(), 1);
        drop(context);
        assert_eq!(ctx.device.live_query_sets(), 0);
        assert_eq!(ctx.device.live_buffers(), 0);
    });
}
