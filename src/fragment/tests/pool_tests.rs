//! Tests for the receiver-side reassembly pool.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use rstest::{fixture, rstest};

use crate::fragment::{
    AckBitmap,
    CapacityScope,
    DefragmenterPool,
    EvictionReason,
    FragmentFlags,
    FragmentFrame,
    FragmentHeader,
    FragmentIndex,
    FragmentStatus,
    FragmentationConfig,
    Fragmenter,
    LateFragmentPolicy,
    MalformedReason,
    MessageId,
    ReassemblyError,
};

const TIMEOUT: Duration = Duration::from_secs(30);

#[fixture]
fn config() -> FragmentationConfig {
    FragmentationConfig {
        mtu: 512,
        reassembly_timeout: TIMEOUT,
        ..FragmentationConfig::default()
    }
}

fn nz(value: usize) -> NonZeroUsize { NonZeroUsize::new(value).expect("non-zero") }

fn message(len: usize) -> Vec<u8> { (0..len).map(|i| (i % 253) as u8).collect() }

fn fragments(id: u32, len: usize) -> Vec<FragmentFrame> {
    Fragmenter::for_mtu(512)
        .expect("valid mtu")
        .fragment_with_id(MessageId::new(id), message(len))
        .expect("fragment")
        .into_fragments()
}

fn feed(
    pool: &mut DefragmenterPool<&'static str>,
    sender: &'static str,
    frame: &FragmentFrame,
    now: Instant,
) -> Result<crate::fragment::Processed<&'static str>, ReassemblyError> {
    pool.process_at(&sender, *frame.header(), frame.payload(), now)
}

#[rstest]
fn out_of_order_fragments_with_duplicate_deliver_once(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(1, 2 * 512 + 1);
    assert_eq!(frames.len(), 3);
    let now = Instant::now();

    let last = feed(&mut pool, "a", &frames[2], now).expect("accepted");
    assert_eq!(last.status, FragmentStatus::Incomplete);
    assert_eq!(
        last.ack.map(|ack| ack.received()),
        Some(AckBitmap::from_bits(0b100))
    );

    let first = feed(&mut pool, "a", &frames[0], now).expect("accepted");
    assert_eq!(first.status, FragmentStatus::Incomplete);
    assert_eq!(first.ack, None, "second ack within the interval is coalesced");

    let middle = feed(&mut pool, "a", &frames[1], now).expect("accepted");
    assert_eq!(middle.status, FragmentStatus::Complete);
    assert_eq!(
        middle.ack.map(|ack| ack.received()),
        Some(AckBitmap::full(3))
    );
    let delivered = middle.delivered.expect("message delivered");
    assert_eq!(*delivered.sender(), "a");
    assert_eq!(delivered.message_id(), MessageId::new(1));
    assert_eq!(delivered.payload(), message(1025).as_slice());
    assert_eq!(pool.buffered_len(), 0);

    let duplicate = feed(&mut pool, "a", &frames[1], now).expect("accepted");
    assert_eq!(duplicate.status, FragmentStatus::Duplicate);
    assert_eq!(duplicate.delivered, None);
    assert_eq!(
        duplicate.ack.map(|ack| ack.received()),
        Some(AckBitmap::full(3))
    );
    assert_eq!(pool.buffered_len(), 0);
}

#[rstest]
fn duplicate_before_completion_refreshes_without_copy(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(1, 1025);
    let now = Instant::now();

    feed(&mut pool, "a", &frames[0], now).expect("accepted");
    let again = feed(&mut pool, "a", &frames[0], now + Duration::from_secs(1)).expect("accepted");
    assert_eq!(again.status, FragmentStatus::Duplicate);
    assert_eq!(
        again.ack.map(|ack| ack.received()),
        Some(AckBitmap::from_bits(0b1))
    );

    // The refreshed activity keeps the buffer alive past the original deadline.
    assert!(pool.purge_expired_at(now + TIMEOUT).is_empty());
    assert_eq!(pool.buffered_len(), 1);
}

#[rstest]
fn coalesced_acks_are_flushed_later(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(4, 4 * 487);
    let now = Instant::now();

    assert!(feed(&mut pool, "a", &frames[0], now).expect("ok").ack.is_some());
    assert!(feed(&mut pool, "a", &frames[1], now).expect("ok").ack.is_none());
    assert!(pool.flush_acks_at(now + Duration::from_millis(1)).is_empty());

    let flushed = pool.flush_acks_at(now + config.ack_interval);
    assert_eq!(flushed.len(), 1);
    let (sender, ack) = flushed[0];
    assert_eq!(sender, "a");
    assert_eq!(ack.message_id(), MessageId::new(4));
    assert_eq!(ack.received(), AckBitmap::full(2));
}

#[rstest]
fn per_sender_cap_evicts_least_recently_active(config: FragmentationConfig) {
    let cap = 3;
    let config = FragmentationConfig {
        per_sender_cap: nz(cap),
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let t0 = Instant::now();

    for id in 0..=u32::try_from(cap).expect("fits") {
        let at = t0 + Duration::from_millis(u64::from(id));
        let processed = feed(&mut pool, "a", &fragments(id, 1025)[0], at).expect("accepted");
        assert!(pool.buffered_len_for(&"a") <= cap);
        if id == 3 {
            let evicted = processed.evicted.expect("oldest evicted");
            assert_eq!(evicted.message_id, MessageId::new(0));
            assert_eq!(
                evicted.reason,
                EvictionReason::Capacity(CapacityScope::PerSender)
            );
        } else {
            assert_eq!(processed.evicted, None);
        }
    }
    assert_eq!(pool.buffered_len_for(&"a"), cap);

    // The evicted message never completes.
    let later = t0 + Duration::from_secs(1);
    for frame in &fragments(0, 1025)[1..] {
        let processed = feed(&mut pool, "a", frame, later).expect("accepted");
        assert_eq!(processed.status, FragmentStatus::Retired);
        assert_eq!(processed.delivered, None);
    }
}

#[rstest]
fn eviction_never_picks_the_most_recently_touched_buffer(config: FragmentationConfig) {
    let config = FragmentationConfig {
        per_sender_cap: nz(2),
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let t0 = Instant::now();
    let first = fragments(1, 1025);

    feed(&mut pool, "a", &first[0], t0).expect("accepted");
    feed(&mut pool, "a", &fragments(2, 1025)[0], t0 + Duration::from_millis(1)).expect("accepted");
    feed(&mut pool, "a", &first[1], t0 + Duration::from_millis(2)).expect("accepted");

    let processed =
        feed(&mut pool, "a", &fragments(3, 1025)[0], t0 + Duration::from_millis(3)).expect("ok");
    assert_eq!(
        processed.evicted.map(|eviction| eviction.message_id),
        Some(MessageId::new(2))
    );

    let done = feed(&mut pool, "a", &first[2], t0 + Duration::from_millis(4)).expect("ok");
    assert!(done.delivered.is_some());
}

#[rstest]
fn cap_of_one_refuses_new_messages(config: FragmentationConfig) {
    let config = FragmentationConfig {
        per_sender_cap: nz(1),
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let now = Instant::now();

    feed(&mut pool, "a", &fragments(1, 1025)[0], now).expect("accepted");
    assert_eq!(
        feed(&mut pool, "a", &fragments(2, 1025)[0], now),
        Err(ReassemblyError::CapacityExceeded {
            message_id: MessageId::new(2),
            scope: CapacityScope::PerSender,
            limit: nz(1),
        })
    );
    assert_eq!(pool.buffered_len(), 1);

    // Other senders are unaffected.
    feed(&mut pool, "b", &fragments(2, 1025)[0], now).expect("accepted");
    assert_eq!(pool.buffered_len(), 2);
}

#[rstest]
fn global_cap_evicts_across_senders(config: FragmentationConfig) {
    let config = FragmentationConfig {
        per_sender_cap: nz(2),
        global_cap: nz(2),
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let t0 = Instant::now();

    feed(&mut pool, "a", &fragments(1, 1025)[0], t0).expect("accepted");
    feed(&mut pool, "b", &fragments(1, 1025)[0], t0 + Duration::from_millis(1)).expect("ok");
    let processed =
        feed(&mut pool, "c", &fragments(1, 1025)[0], t0 + Duration::from_millis(2)).expect("ok");

    let evicted = processed.evicted.expect("global eviction");
    assert_eq!(evicted.sender, "a");
    assert_eq!(evicted.reason, EvictionReason::Capacity(CapacityScope::Global));
    assert_eq!(pool.buffered_len(), 2);
    assert_eq!(pool.buffered_len_for(&"a"), 0);
}

#[rstest]
fn global_eviction_skips_the_most_recently_touched_buffer(config: FragmentationConfig) {
    let config = FragmentationConfig {
        per_sender_cap: nz(2),
        global_cap: nz(2),
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let t0 = Instant::now();
    let oldest = fragments(1, 1025);

    feed(&mut pool, "a", &oldest[0], t0).expect("accepted");
    feed(&mut pool, "b", &fragments(1, 1025)[0], t0 + Duration::from_millis(1)).expect("ok");
    feed(&mut pool, "a", &oldest[1], t0 + Duration::from_millis(2)).expect("accepted");

    let processed =
        feed(&mut pool, "c", &fragments(1, 1025)[0], t0 + Duration::from_millis(3)).expect("ok");
    let evicted = processed.evicted.expect("global eviction");
    assert_eq!(evicted.sender, "b");
    assert_eq!(evicted.reason, EvictionReason::Capacity(CapacityScope::Global));
    assert_eq!(pool.buffered_len_for(&"a"), 1);

    let done = feed(&mut pool, "a", &oldest[2], t0 + Duration::from_millis(4)).expect("ok");
    assert!(done.delivered.is_some());
}

#[rstest]
fn global_cap_of_one_refuses_other_senders(config: FragmentationConfig) {
    let config = FragmentationConfig {
        per_sender_cap: nz(1),
        global_cap: nz(1),
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let now = Instant::now();

    feed(&mut pool, "a", &fragments(1, 1025)[0], now).expect("accepted");
    assert_eq!(
        feed(&mut pool, "b", &fragments(1, 1025)[0], now + Duration::from_millis(1)),
        Err(ReassemblyError::CapacityExceeded {
            message_id: MessageId::new(1),
            scope: CapacityScope::Global,
            limit: nz(1),
        })
    );
    assert_eq!(pool.buffered_len_for(&"a"), 1);
    assert_eq!(pool.buffered_len_for(&"b"), 0);
}

#[rstest]
fn idle_buffers_expire_without_delivery(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(9, 1025);
    let t0 = Instant::now();

    feed(&mut pool, "a", &frames[0], t0).expect("accepted");
    feed(&mut pool, "a", &frames[1], t0).expect("accepted");
    assert!(pool.purge_expired_at(t0 + TIMEOUT - Duration::from_millis(1)).is_empty());

    let expired = pool.purge_expired_at(t0 + TIMEOUT);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].message_id, MessageId::new(9));
    assert_eq!(expired[0].reason, EvictionReason::TimedOut);
    assert_eq!(pool.buffered_len(), 0);

    let late = feed(&mut pool, "a", &frames[2], t0 + TIMEOUT).expect("accepted");
    assert_eq!(late.status, FragmentStatus::Retired);
    assert_eq!(late.delivered, None);
    assert_eq!(late.ack, None);
    assert_eq!(pool.buffered_len(), 0);
}

#[rstest]
fn idle_buffer_is_not_completed_before_the_next_sweep(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(9, 1025);
    let t0 = Instant::now();

    feed(&mut pool, "a", &frames[0], t0).expect("accepted");
    feed(&mut pool, "a", &frames[1], t0).expect("accepted");

    let late = feed(&mut pool, "a", &frames[2], t0 + TIMEOUT + Duration::from_secs(10))
        .expect("accepted");
    assert_eq!(late.status, FragmentStatus::Retired);
    assert_eq!(late.delivered, None);
    assert_eq!(late.ack, None);
    let expired = late.evicted.expect("timed out buffer reported");
    assert_eq!(expired.message_id, MessageId::new(9));
    assert_eq!(expired.reason, EvictionReason::TimedOut);
    assert_eq!(pool.buffered_len(), 0);

    let swept = pool.purge_expired_at(t0 + TIMEOUT + Duration::from_secs(11));
    assert!(swept.is_empty(), "buffer was already retired");
}

#[rstest]
fn start_fresh_policy_discards_idle_data_before_the_sweep(config: FragmentationConfig) {
    let config = FragmentationConfig {
        late_fragment_policy: LateFragmentPolicy::StartFresh,
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(9, 1025);
    let t0 = Instant::now();

    feed(&mut pool, "a", &frames[0], t0).expect("accepted");
    feed(&mut pool, "a", &frames[1], t0).expect("accepted");

    let t1 = t0 + TIMEOUT;
    let restarted = feed(&mut pool, "a", &frames[2], t1).expect("accepted");
    assert_eq!(restarted.status, FragmentStatus::Incomplete);
    assert_eq!(restarted.delivered, None);
    assert_eq!(
        restarted.evicted.map(|eviction| eviction.reason),
        Some(EvictionReason::TimedOut)
    );
    assert_eq!(
        restarted.ack.map(|ack| ack.received()),
        Some(AckBitmap::from_bits(0b100))
    );
    assert_eq!(pool.buffered_len(), 1);
}

#[rstest]
fn start_fresh_policy_rebuilds_timed_out_messages(config: FragmentationConfig) {
    let config = FragmentationConfig {
        late_fragment_policy: LateFragmentPolicy::StartFresh,
        ..config
    };
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(9, 1025);
    let t0 = Instant::now();

    feed(&mut pool, "a", &frames[0], t0).expect("accepted");
    pool.purge_expired_at(t0 + TIMEOUT);

    let t1 = t0 + TIMEOUT;
    let restarted = feed(&mut pool, "a", &frames[2], t1).expect("accepted");
    assert_eq!(restarted.status, FragmentStatus::Incomplete);
    feed(&mut pool, "a", &frames[0], t1).expect("accepted");
    let done = feed(&mut pool, "a", &frames[1], t1).expect("accepted");
    assert_eq!(
        done.delivered.map(|m| m.into_payload().to_vec()),
        Some(message(1025))
    );
}

#[rstest]
fn malformed_fragments_leave_other_buffers_untouched(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let now = Instant::now();
    let frames = fragments(1, 1025);
    feed(&mut pool, "a", &frames[0], now).expect("accepted");

    let header = *frames[1].header();
    assert!(matches!(
        pool.process_at(&"a", header, &frames[1].payload()[1..], now),
        Err(ReassemblyError::Malformed {
            reason: MalformedReason::LengthMismatch { .. },
            ..
        })
    ));

    let wrong_total = FragmentHeader::new(
        MessageId::new(1),
        FragmentIndex::new(1),
        2000,
        487,
        487,
        FragmentFlags::NONE,
    );
    assert_eq!(
        pool.process_at(&"a", wrong_total, frames[1].payload(), now),
        Err(ReassemblyError::Malformed {
            message_id: MessageId::new(1),
            reason: MalformedReason::TotalLengthMismatch {
                expected: 1025,
                found: 2000,
            },
        })
    );

    let oversized = FragmentHeader::new(
        MessageId::new(2),
        FragmentIndex::zero(),
        u32::MAX,
        0,
        1,
        FragmentFlags::NONE,
    );
    assert!(matches!(
        pool.process_at(&"a", oversized, &[0], now),
        Err(ReassemblyError::Malformed {
            reason: MalformedReason::MessageTooLarge { .. },
            ..
        })
    ));

    assert_eq!(pool.buffered_len(), 1);
    feed(&mut pool, "a", &frames[1], now).expect("accepted");
    let done = feed(&mut pool, "a", &frames[2], now).expect("accepted");
    assert!(done.delivered.is_some());
}

#[rstest]
fn empty_message_is_delivered(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let frames = fragments(5, 0);
    let processed = feed(&mut pool, "a", &frames[0], Instant::now()).expect("accepted");
    assert_eq!(processed.status, FragmentStatus::Complete);
    assert_eq!(
        processed.delivered.map(|m| m.payload().len()),
        Some(0)
    );
}

#[rstest]
fn senders_are_reassembled_independently(config: FragmentationConfig) {
    let mut pool = DefragmenterPool::new(config).expect("valid config");
    let now = Instant::now();
    let frames = fragments(1, 1025);

    for frame in &frames[..2] {
        feed(&mut pool, "a", frame, now).expect("accepted");
        feed(&mut pool, "b", frame, now).expect("accepted");
    }
    let a = feed(&mut pool, "a", &frames[2], now).expect("accepted");
    assert_eq!(a.delivered.map(|m| *m.sender()), Some("a"));
    assert_eq!(pool.buffered_len_for(&"b"), 1);
}
