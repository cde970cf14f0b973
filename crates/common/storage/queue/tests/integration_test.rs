// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::Path, sync::Arc, time::Duration};

use queue::{
    FlushMode, NO_INDEX, Queue, QueueBuilder, QueueError, ReadStatus, RollCycle, SetTimeProvider,
    Tailer, TailerDirection, TimeProvider, UNPOSITIONED_INDEX,
};
use tempfile::TempDir;
use test_case::test_case;
use tracing_subscriber::EnvFilter;

const DAY: i64 = 86_400_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_daily(path: &Path) -> Queue {
    QueueBuilder::new(path)
        .roll_cycle(RollCycle::DAILY)
        .block_size(1024 * 1024)
        .build()
        .unwrap()
}

fn read_text(tailer: &mut Tailer) -> Option<String> {
    match tailer.read_next().unwrap() {
        ReadStatus::Excerpt(excerpt) => Some(String::from_utf8(excerpt.payload.to_vec()).unwrap()),
        ReadStatus::Busy | ReadStatus::EndOfStream => None,
    }
}

fn message(id: usize) -> String { format!("Test entry: {id}") }

#[test]
fn test_write_at_index_across_reopens() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();

    {
        let queue = open_daily(temp_dir.path());
        let mut appender = queue.create_appender();
        appender.write_at(0x421d_0000_0000, "hello world").unwrap();
        appender.write_at(0x421d_0000_0001, "hello world").unwrap();
    }

    // Try again and fail.
    {
        let queue = open_daily(temp_dir.path());
        let mut appender = queue.create_appender();
        let err = appender
            .write_at(0x421d_0000_0000, "hello world")
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyExists { .. }));
        assert_eq!(
            err.to_string(),
            "Unable to move to index 421d00000000 as the index already exists"
        );
    }

    // Try too far.
    {
        let queue = open_daily(temp_dir.path());
        let mut appender = queue.create_appender();
        let err = appender
            .write_at(0x421d_0000_0003, "hello world")
            .unwrap_err();
        assert!(matches!(err, QueueError::OutOfRange { .. }));
        assert_eq!(
            err.to_string(),
            "Unable to move to index 421d00000003 beyond the end of the queue"
        );
    }

    {
        let queue = open_daily(temp_dir.path());
        let mut appender = queue.create_appender();
        appender.write_at(0x421d_0000_0002, "hello world").unwrap();
        appender.write_at(0x421d_0000_0003, "hello world").unwrap();
        assert_eq!(appender.last_index_appended(), 0x421d_0000_0003);
        assert_eq!(queue.last_index().unwrap(), 0x421d_0000_0003);
        assert_eq!(queue.first_index().unwrap(), 0x421d_0000_0000);
    }
}

#[test]
fn test_write_at_on_fresh_store() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_daily(temp_dir.path());
    let mut appender = queue.create_appender();
    let index = RollCycle::DAILY.to_index(20_000, 0).unwrap();

    appender.write_at(index, "p").unwrap();
    assert!(matches!(
        appender.write_at(index, "p2"),
        Err(QueueError::AlreadyExists { .. })
    ));
    assert!(matches!(
        appender.write_at(index + 2, "skip"),
        Err(QueueError::OutOfRange { .. })
    ));
    appender.write_at(index + 1, "p3").unwrap();
    appender.write_at(index + 2, "p4").unwrap();

    let mut tailer = queue.create_tailer();
    let read: Vec<String> = tailer
        .by_ref()
        .map(|excerpt| String::from_utf8(excerpt.unwrap().payload.to_vec()).unwrap())
        .collect();
    assert_eq!(read, vec!["p", "p3", "p4"]);
}

#[test]
fn test_tailer_index_before_and_after_first_write() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY + 1_000));
    let queue = QueueBuilder::new(temp_dir.path())
        .time_provider(clock)
        .build()
        .unwrap();

    let queue_index = queue.next_index_to_write().unwrap();
    let mut tailer = queue.create_tailer();

    assert_eq!(tailer.read_next().unwrap(), ReadStatus::EndOfStream);
    assert_eq!(tailer.index(), UNPOSITIONED_INDEX);

    let written = queue.create_appender().write([0u8]).unwrap();
    assert_eq!(written, queue_index);

    match tailer.read_next().unwrap() {
        ReadStatus::Excerpt(excerpt) => {
            assert_eq!(excerpt.index, queue_index);
            assert_eq!(excerpt.payload.as_ref(), &[0u8]);
        }
        other => panic!("expected the written record, got {other:?}"),
    }
    assert_eq!(tailer.index(), written + 1);
}

#[test]
fn test_written_and_read_indexes_match() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_daily(temp_dir.path());
    let mut appender = queue.create_appender();

    let expected = appender.write("some-data").unwrap();
    assert!(expected > 0);
    assert_eq!(appender.last_index_appended(), expected);

    let mut tailer = queue.create_tailer();
    let ReadStatus::Excerpt(excerpt) = tailer.read_next().unwrap() else {
        panic!("record should be readable");
    };
    assert_eq!(excerpt.index, expected);
    assert_eq!(excerpt.payload, "some-data");
}

#[test]
fn test_tailer_forward_backward_read() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    // Half past the hour, so every write lands in the same cycle.
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY + 30 * 60 * 1000));
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(RollCycle::HOURLY)
        .block_size(256 * 1024)
        .time_provider(clock)
        .build()
        .unwrap();
    let mut appender = queue.create_appender();
    let mut tailer = queue.create_tailer();

    let indexes: Vec<i64> = (0..4)
        .map(|i| appender.write(message(i)).unwrap())
        .collect();

    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(0).as_str()));
    assert_eq!(tailer.index(), indexes[1]);
    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(1).as_str()));
    assert_eq!(tailer.index(), indexes[2]);

    tailer.direction(TailerDirection::Backward);

    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(2).as_str()));
    assert_eq!(tailer.index(), indexes[1]);
    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(1).as_str()));
    assert_eq!(tailer.index(), indexes[0]);
    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(0).as_str()));
    assert_eq!(read_text(&mut tailer), None);

    tailer.direction(TailerDirection::Forward);

    assert_eq!(read_text(&mut tailer), None);
    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(0).as_str()));
    assert_eq!(tailer.index(), indexes[1]);
    assert_eq!(read_text(&mut tailer).as_deref(), Some(message(1).as_str()));
    assert_eq!(tailer.index(), indexes[2]);
}

#[test_case(RollCycle::DAILY, 1024 * 1024 ; "daily")]
#[test_case(RollCycle::TEST_DAILY, 64 * 1024 ; "test daily")]
fn test_tailer_backwards_read_beyond_cycle(roll_cycle: RollCycle, block_size: u64) {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let now = 20_500 * DAY + 3_600_000;
    let clock = Arc::new(SetTimeProvider::new(now));
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(roll_cycle)
        .block_size(block_size)
        .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
        .build()
        .unwrap();
    let mut appender = queue.create_appender();

    let mut indexes = Vec::new();
    let mut messages = Vec::new();
    for day in -7..=0_i64 {
        if day == -5 || day == -4 {
            // Nothing on those days.
            continue;
        }
        clock.set_current_time_millis(now + day * DAY);
        for _ in 0..3 {
            let msg = message(indexes.len());
            indexes.push(appender.write(&msg).unwrap());
            messages.push(msg);
        }
    }

    let mut tailer = queue.create_tailer();
    tailer.direction(TailerDirection::Backward).to_end().unwrap();

    for i in (0..indexes.len()).rev() {
        assert_eq!(tailer.index(), indexes[i], "wrong index {i}");
        assert_eq!(
            read_text(&mut tailer).as_deref(),
            Some(messages[i].as_str()),
            "wrong message {i}"
        );
    }
    assert_eq!(read_text(&mut tailer), None);

    // Forward over the same gap.
    tailer.direction(TailerDirection::Forward).to_start().unwrap();
    let forward: Vec<String> = tailer
        .by_ref()
        .map(|excerpt| String::from_utf8(excerpt.unwrap().payload.to_vec()).unwrap())
        .collect();
    assert_eq!(forward, messages);
}

#[test]
fn test_sequential_indexes_are_strictly_increasing() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY));
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(RollCycle::TEST_DAILY)
        .block_size(64 * 1024)
        .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
        .build()
        .unwrap();
    let roll_cycle = *queue.roll_cycle();
    let mut appender = queue.create_appender();

    let mut previous = NO_INDEX;
    let mut previous_cycle = -1;
    let mut expected_sequence = 0;
    // Eight records per cycle, rolling daily.
    for i in 0..48 {
        if i % 8 == 0 {
            clock.advance(Duration::from_millis(u64::try_from(DAY).unwrap()));
        }
        let index = appender.write(format!("record {i}")).unwrap();
        assert!(index > previous);

        let cycle = roll_cycle.to_cycle(index);
        assert!(cycle >= previous_cycle);
        if cycle != previous_cycle {
            expected_sequence = 0;
        }
        assert_eq!(roll_cycle.to_sequence(index), expected_sequence);

        expected_sequence += 1;
        previous_cycle = cycle;
        previous = index;
    }
}

#[test_case(FlushMode::Async ; "async")]
#[test_case(FlushMode::Sync ; "sync")]
#[test_case(FlushMode::Batch { bytes: 1024 } ; "batch")]
fn test_queue_recovery(flush_mode: FlushMode) {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY));
    let open = || {
        QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::DAILY)
            .block_size(1024 * 1024)
            .flush_mode(flush_mode)
            .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
            .build()
            .unwrap()
    };

    let last = {
        let queue = open();
        let mut appender = queue.create_appender();
        let mut last = NO_INDEX;
        for i in 0..50 {
            last = appender.write(format!("msg-{i}")).unwrap();
        }
        appender.flush().unwrap();
        last
    };

    let queue = open();
    assert_eq!(queue.last_index().unwrap(), last);
    let mut appender = queue.create_appender();
    for i in 50..100 {
        let index = appender.write(format!("msg-{i}")).unwrap();
        assert_eq!(index, last + i - 49);
    }

    let tailer = queue.create_tailer();
    let all: Vec<String> = tailer
        .map(|excerpt| String::from_utf8(excerpt.unwrap().payload.to_vec()).unwrap())
        .collect();
    assert_eq!(all.len(), 100);
    for (i, msg) in all.iter().enumerate() {
        assert_eq!(msg, &format!("msg-{i}"));
    }
}

#[test]
fn test_torn_frame_is_reclaimed_on_reopen() {
    use std::os::unix::fs::FileExt;

    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY));
    let open = || {
        QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::TEST_DAILY)
            .block_size(64 * 1024)
            .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
            .build()
            .unwrap()
    };

    let (path, torn_at) = {
        let queue = open();
        queue.create_appender().write("survivor").unwrap();
        let segment = queue.store().segment_for(20_000, false).unwrap().unwrap();
        (
            segment.path().to_path_buf(),
            segment.frontier().unwrap().write_position,
        )
    };

    // A writer that died after reserving its frame: in-progress header and
    // part of a payload.
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&((1u32 << 31) | 64).to_le_bytes(), torn_at)
        .unwrap();
    file.write_all_at(&[0x5A; 40], torn_at + 4).unwrap();
    drop(file);

    let queue = open();
    let mut tailer = queue.create_tailer();
    assert_eq!(read_text(&mut tailer).as_deref(), Some("survivor"));
    assert_eq!(tailer.read_next().unwrap(), ReadStatus::Busy);

    let index = queue.create_appender().write("after crash").unwrap();
    assert_eq!(RollCycle::TEST_DAILY.to_sequence(index), 1);
    assert_eq!(read_text(&mut tailer).as_deref(), Some("after crash"));
    assert_eq!(read_text(&mut tailer), None);
}

#[test]
fn test_concurrent_reader_sees_every_record_in_order() {
    const RECORDS: usize = 2_000;

    let temp_dir = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(RollCycle::DAILY)
        .block_size(4 * 1024 * 1024)
        .time_provider(Arc::new(SetTimeProvider::new(20_000 * DAY)))
        .build()
        .unwrap();

    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            let mut appender = queue.create_appender();
            for i in 0..RECORDS {
                appender.write(format!("record-{i:05}")).unwrap();
            }
        });

        let reader = s.spawn(|| {
            let mut tailer = queue.create_tailer();
            let mut seen = 0;
            let mut last_index = NO_INDEX;
            while seen < RECORDS {
                match tailer.read_next().unwrap() {
                    ReadStatus::Excerpt(excerpt) => {
                        assert!(excerpt.index > last_index);
                        assert_eq!(excerpt.payload, format!("record-{seen:05}"));
                        last_index = excerpt.index;
                        seen += 1;
                    }
                    ReadStatus::Busy | ReadStatus::EndOfStream => std::thread::yield_now(),
                }
            }
            seen
        });

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), RECORDS);
    });
}

#[test]
fn test_second_queue_instance_sees_new_cycles() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY));
    let build = || {
        QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::TEST_DAILY)
            .block_size(64 * 1024)
            .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
            .build()
            .unwrap()
    };
    let writer_queue = build();
    let reader_queue = build();

    let mut appender = writer_queue.create_appender();
    let mut tailer = reader_queue.create_tailer();

    appender.write("day one").unwrap();
    assert_eq!(read_text(&mut tailer).as_deref(), Some("day one"));
    assert_eq!(read_text(&mut tailer), None);

    clock.set_current_time_millis(20_003 * DAY);
    appender.write("day four").unwrap();
    assert_eq!(read_text(&mut tailer).as_deref(), Some("day four"));
    assert_eq!(Tailer::cycle(&tailer), Some(20_003));
}

#[test]
fn test_write_after_another_instance_moved_ahead() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(10 * DAY));
    let build = || {
        QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::TEST_DAILY)
            .block_size(64 * 1024)
            .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
            .build()
            .unwrap()
    };
    let first = build();
    let mut first_appender = first.create_appender();
    let i0 = first_appender.write("a").unwrap();

    let i1 = RollCycle::TEST_DAILY.to_index(12, 0).unwrap();
    {
        let second = build();
        second.create_appender().write_at(i1, "c").unwrap();
    }

    let i2 = first_appender.write("b").unwrap();
    assert!(i0 < i1 && i1 < i2, "{i0:x} {i1:x} {i2:x}");

    let mut tailer = first.create_tailer();
    let read: Vec<String> = std::iter::from_fn(|| read_text(&mut tailer)).collect();
    assert_eq!(read, ["a", "c", "b"]);
}

#[test]
fn test_cycle_larger_than_block_size() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(SetTimeProvider::new(20_000 * DAY));
    let build = || {
        QueueBuilder::new(temp_dir.path())
            .roll_cycle(RollCycle::TEST_DAILY)
            .block_size(4096)
            .time_provider(Arc::clone(&clock) as Arc<dyn TimeProvider>)
            .build()
            .unwrap()
    };
    let writer_queue = build();
    let reader_queue = build();
    let mut appender = writer_queue.create_appender();
    let mut tailer = reader_queue.create_tailer();

    const RECORDS: usize = 500;
    let padded = |i: usize| format!("{}{}", message(i), "x".repeat(80));
    for i in 0..RECORDS {
        appender.write(padded(i)).unwrap();
        // The reader follows as the writer grows the file past its mapping.
        assert_eq!(read_text(&mut tailer), Some(padded(i)));
    }
    assert_eq!(read_text(&mut tailer), None);
    assert_eq!(appender.cycle(), Some(20_000));

    let mut backward = reader_queue.create_tailer();
    backward.direction(TailerDirection::Backward).to_end().unwrap();
    for i in (0..RECORDS).rev() {
        assert_eq!(read_text(&mut backward), Some(padded(i)));
    }
    assert_eq!(read_text(&mut backward), None);
}

#[test]
fn test_random_access_deep_into_a_cycle() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    // 16 entries of spacing 4: one index level would cover sequences below
    // 64, two levels cover 1024.
    let roll_cycle =
        RollCycle::new("DEEP", "%Y%m%d", Duration::from_secs(86_400), 16, 4).unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .roll_cycle(roll_cycle)
        .block_size(64 * 1024)
        .time_provider(Arc::new(SetTimeProvider::new(20_000 * DAY)))
        .build()
        .unwrap();
    let mut appender = queue.create_appender();

    const RECORDS: usize = 1200;
    let indexes: Vec<i64> = (0..RECORDS)
        .map(|i| appender.write(message(i)).unwrap())
        .collect();

    let mut tailer = queue.create_tailer();
    for i in [0, 63, 64, 65, 500, 1023, 1024, 1199] {
        assert!(tailer.move_to_index(indexes[i]).unwrap());
        assert_eq!(read_text(&mut tailer), Some(message(i)));
    }

    tailer.direction(TailerDirection::Backward);
    assert!(tailer.move_to_index(indexes[900]).unwrap());
    for i in (800..=900).rev() {
        assert_eq!(read_text(&mut tailer), Some(message(i)));
    }
}
