//! Producer to consumer, through the public API and the software device.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use frame_relay::backend::software::{SharedHandles, SoftwareDevice};
use frame_relay::{
    CachedImporter, ChannelLayout, ChannelReader, ChannelWriter, Color, Device, FenceHandle,
    FrameError, FramePump, ImportFault, PixelFormat, PixelRect, PixelSize, ProducerKind,
    RelayConfig, Snapshot, Sprite, SpriteBatch, TextureHandle, TickOutcome, TickRequest,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn snapshot(sequence: u64, texture: TextureHandle, size: PixelSize, fence: FenceHandle) -> Snapshot {
    Snapshot {
        sequence,
        size,
        format: PixelFormat::Rgba8Unorm,
        producer: ProducerKind::Software,
        texture,
        fence,
        fence_value: sequence,
    }
}

#[test]
fn repeated_reads_of_one_publish_import_once() {
    init_tracing();
    let handles = SharedHandles::new();
    let mut device = SoftwareDevice::new(handles.clone());
    let layout = Arc::new(ChannelLayout::new());
    let mut writer = ChannelWriter::new(layout.clone());
    let reader = ChannelReader::new(layout);
    let mut cache = CachedImporter::new();

    let size = PixelSize::new(800, 600);
    let fence = handles.create_fence(0);
    let h1 = handles.create_texture(size, PixelFormat::Rgba8Unorm);
    writer.publish(&snapshot(5, h1, size, fence));

    for _ in 0..2 {
        let latest = reader.latest().unwrap();
        assert_eq!(latest.sequence, 5);
        let frame = cache.resolve(&mut device, &latest).unwrap();
        assert_eq!(frame.sequence, 5);
    }
    assert_eq!(cache.stats().texture_imports, 1);
    assert_eq!(cache.stats().fence_imports, 1);

    let h2 = handles.create_texture(size, PixelFormat::Rgba8Unorm);
    writer.publish(&snapshot(6, h2, size, fence));
    let latest = reader.latest().unwrap();
    assert!(cache.resolve(&mut device, &latest).unwrap().imported);

    let stats = cache.stats();
    assert_eq!(stats.texture_imports, 2);
    assert_eq!(stats.texture_releases, 1);
    assert_eq!(cache.cached_texture(), Some(h2));
    // H2 and the fence; H1 is gone.
    assert_eq!(device.live_imports(), 2);

    cache.clear(&mut device);
    assert_eq!(device.live_imports(), 0);
}

#[test]
fn twenty_sprites_flush_as_sixteen_plus_four() {
    init_tracing();
    let handles = SharedHandles::new();
    let mut device = SoftwareDevice::new(handles.clone());
    let mut batch = SpriteBatch::<SoftwareDevice>::new();

    let target_size = PixelSize::new(1920, 1080);
    let target_handle = handles.create_target(target_size, PixelFormat::Rgba8Unorm);
    let target = device.open_target(target_handle, target_size).unwrap();
    let white = handles.create_texture(PixelSize::new(4, 4), PixelFormat::Rgba8Unorm);
    handles.fill(white, Color::WHITE);
    let source = device
        .import_texture(
            white,
            &frame_relay::TextureDesc {
                producer: ProducerKind::Software,
                size: PixelSize::new(4, 4),
                format: PixelFormat::Rgba8Unorm,
            },
        )
        .unwrap();
    let completion = handles.create_fence(0);
    let mut fence = device
        .import_fence(ProducerKind::Software, completion)
        .unwrap();

    let sprites: Vec<(PixelRect, Color)> = (0..20u8)
        .map(|i| {
            let (col, row) = (u32::from(i % 5), u32::from(i / 5));
            let rect = PixelRect::new(col * 384, row * 270, 300, 200);
            let tint = Color::from_rgba8([i * 12, 255 - i * 12, 128, 255]);
            (rect, tint)
        })
        .collect();

    let view = device.texture_view(&source);
    batch.begin(device.target_view(&target), target_size);
    batch.clear(Some(Color::BLACK));
    for (dest_rect, tint) in &sprites {
        batch
            .draw(
                &mut device,
                &Sprite {
                    source: view,
                    source_size: PixelSize::new(4, 4),
                    source_rect: PixelRect::new(0, 0, 4, 4),
                    dest_rect: *dest_rect,
                    tint: *tint,
                },
            )
            .unwrap();
    }
    batch.end(&mut device, Some((&mut fence, 1))).unwrap();

    let calls = device.take_draw_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].vertices.len(), 16 * 6);
    assert_eq!(calls[1].vertices.len(), 4 * 6);
    assert_eq!(calls[0].clear, Some(Color::BLACK));
    assert_eq!(calls[1].clear, None);
    assert_eq!(batch.stats().flushes, 2);
    assert_eq!(handles.fence_value(completion), Some(1));

    for (dest_rect, tint) in &sprites {
        let (x, y) = dest_rect.center();
        let pixel = handles.read_pixel(target_handle, x, y).unwrap();
        let expected = tint.to_rgba8();
        for (got, want) in pixel.iter().zip(expected) {
            assert!(got.abs_diff(want) <= 1, "{pixel:?} != {expected:?} at ({x}, {y})");
        }
    }
    // Gutter between sprites keeps the clear.
    assert_eq!(handles.read_pixel(target_handle, 350, 10), Some([0, 0, 0, 255]));

    device.release_fence(fence);
    device.release_texture(source);
    device.release_target(target);
    assert_eq!(device.live_imports(), 0);
}

#[test]
fn empty_batch_still_signals_completion() {
    init_tracing();
    let handles = SharedHandles::new();
    let mut device = SoftwareDevice::new(handles.clone());
    let mut batch = SpriteBatch::<SoftwareDevice>::new();
    let size = PixelSize::new(8, 8);
    let target = device
        .open_target(handles.create_target(size, PixelFormat::Rgba8Unorm), size)
        .unwrap();
    let completion = handles.create_fence(3);
    let mut fence = device
        .import_fence(ProducerKind::Software, completion)
        .unwrap();

    batch.begin(device.target_view(&target), size);
    batch.end(&mut device, Some((&mut fence, 4))).unwrap();

    assert!(device.draw_calls().is_empty());
    assert_eq!(handles.fence_value(completion), Some(4));
    device.release_fence(fence);
    device.release_target(target);
}

#[test]
fn foreign_producer_is_reported_and_retried() {
    init_tracing();
    let handles = SharedHandles::new();
    let layout = Arc::new(ChannelLayout::new());
    let mut writer = ChannelWriter::new(layout.clone());
    let device = SoftwareDevice::new(handles.clone());
    let mut pump = FramePump::new(device, layout, &RelayConfig::default()).unwrap();

    let size = PixelSize::new(16, 16);
    let request = TickRequest {
        target: handles.create_target(size, PixelFormat::Rgba8Unorm),
        target_size: size,
        dest_rect: size.to_rect(),
        completion_fence: None,
    };
    writer.publish(&Snapshot {
        producer: ProducerKind::D3D12,
        ..snapshot(1, TextureHandle(9), size, FenceHandle(9))
    });

    let expected = Err(FrameError::Import(ImportFault::DeviceMismatch {
        device: "software",
        producer: ProducerKind::D3D12,
    }));
    assert_eq!(pump.tick(&request), expected);
    // The frame was not consumed.
    assert_eq!(pump.tick(&request), expected);
    assert_eq!(pump.import_stats().texture_imports, 0);
}

#[cfg(unix)]
#[test]
fn producer_thread_feeds_pump_through_shared_memory() {
    use frame_relay::ShmRegion;

    const FRAMES: u64 = 20;
    init_tracing();
    let size = PixelSize::new(32, 32);
    let config = RelayConfig {
        channel_name: format!("/frame-relay-e2e-{}", std::process::id()),
        clear_color: Some(Color::BLACK),
        ..RelayConfig::default()
    };

    let handles = SharedHandles::new();
    let producer_fence = handles.create_fence(0);
    let region = ShmRegion::create(&config.channel_name).unwrap();
    let memory = config.open_channel().unwrap();

    let device = SoftwareDevice::new(handles.clone());
    let mut pump = FramePump::new(device, memory, &config).unwrap();
    let completion = handles.create_fence(0);
    let request = TickRequest {
        target: handles.create_target(size, PixelFormat::Rgba8Unorm),
        target_size: size,
        dest_rect: size.to_rect(),
        completion_fence: Some(completion),
    };

    let producer_handles = handles.clone();
    let producer = std::thread::spawn(move || {
        let mut writer = ChannelWriter::new(region);
        let textures: Vec<TextureHandle> = (0..2)
            .map(|_| producer_handles.create_texture(size, PixelFormat::Rgba8Unorm))
            .collect();
        for sequence in 1..=FRAMES {
            #[allow(clippy::cast_possible_truncation)]
            let texture = textures[sequence as usize % 2];
            #[allow(clippy::cast_precision_loss)]
            let shade = sequence as f32 / FRAMES as f32;
            producer_handles.fill(texture, Color::rgba(shade, 0.0, 0.0, 1.0));
            producer_handles.signal_fence(producer_fence, sequence);
            writer.publish(&snapshot(sequence, texture, size, producer_fence));
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // Keep the mapping alive until the consumer has seen the last frame.
        writer
    });

    let mut last = 0;
    let mut composited = 0;
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while last < FRAMES {
        assert!(std::time::Instant::now() < deadline, "consumer stalled at {last}");
        match pump.tick(&request).unwrap() {
            TickOutcome::NoNewFrame => std::thread::yield_now(),
            TickOutcome::Composited { sequence, .. } => {
                assert!(sequence > last, "sequence went from {last} to {sequence}");
                last = sequence;
                composited += 1;
            }
        }
    }
    drop(producer.join().unwrap());

    assert_eq!(pump.completion_value(), composited);
    assert_eq!(handles.fence_value(completion), Some(composited));
    assert_eq!(handles.read_pixel(request.target, 16, 16), Some([255, 0, 0, 255]));
    // Two producer textures alternate, so at most one import per frame.
    assert!(pump.import_stats().texture_imports <= composited);
}
