use kestrel::memory::frame_allocator::{FrameAllocator, FrameIndex};

#[test]
fn freed_frames_are_reused_lowest_first() {
    // 4096 frames, frames 0-255 reserved.
    let mut frames = FrameAllocator::new(4096);
    assert_eq!(frames.used_frames(), 256);

    let allocated: Vec<FrameIndex> = (0..10)
        .map(|_| frames.allocate_frame(true, true).unwrap().index)
        .collect();
    let expected: Vec<FrameIndex> = (256..266).map(FrameIndex::new).collect();
    assert_eq!(allocated, expected);

    frames.free_frame(allocated[3]).unwrap();
    frames.free_frame(allocated[7]).unwrap();

    let first = frames.allocate_frame(true, true).unwrap().index;
    let second = frames.allocate_frame(true, true).unwrap().index;
    assert_eq!((first, second), (allocated[3], allocated[7]));
    assert_eq!(frames.used_frames(), 266);
}

#[test]
fn live_allocations_never_share_a_frame() {
    let mut frames = FrameAllocator::new(512);
    let mut live: Vec<FrameIndex> = Vec::new();

    for round in 0..200usize {
        if round % 3 == 2 {
            let victim = live.remove(round % live.len());
            frames.free_frame(victim).unwrap();
        } else {
            let index = frames.allocate_frame(true, false).unwrap().index;
            assert!(!live.contains(&index), "frame {} handed out twice", index);
            live.push(index);
        }
    }
    assert_eq!(frames.used_frames(), 256 + live.len());
}

#[test]
fn freeing_an_unallocated_frame_changes_nothing() {
    let mut frames = FrameAllocator::new(4096);
    let before = frames.used_frames();
    assert!(frames.free_frame(FrameIndex::new(1000)).is_err());
    assert_eq!(frames.used_frames(), before);
    assert_eq!(
        frames.allocate_frame(true, true).unwrap().index,
        FrameIndex::new(256)
    );
}
