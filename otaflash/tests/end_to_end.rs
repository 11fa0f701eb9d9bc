//! Host uploader against a bootloader thread over an in-memory link.

use std::thread;
use std::time::Duration;

use otaflash::bootloader::Event;
use otaflash::protocol::crc::crc32;
use otaflash::{
    Bootloader, BootloaderConfig, Command, Error, FirmwareImage, FlashRegion, Frame, MemoryFlash,
    MemoryPort, Phase, Port, ProtocolLimits, ReadPolicy, SessionOutcome, State, UploadConfig,
    Uploader,
};

const BASE: u32 = 0x0802_0000;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn limits() -> ProtocolLimits {
    ProtocolLimits {
        data_max_size: 4,
        ..ProtocolLimits::default()
    }
}

fn bootloader_config() -> BootloaderConfig {
    BootloaderConfig {
        limits: limits(),
        read: ReadPolicy::with_timeout(Duration::from_millis(500)),
        region: FlashRegion {
            base: BASE,
            size: 4096,
        },
        max_idle_polls: Some(10),
        resync_quiet: Duration::from_millis(5),
    }
}

fn upload_config() -> UploadConfig {
    UploadConfig {
        limits: limits(),
        response: ReadPolicy::with_timeout(Duration::from_secs(2)),
        inter_byte_delay: Duration::ZERO,
        inter_frame_delay: Duration::from_millis(1),
    }
}

#[test]
fn ten_byte_image_in_four_byte_chunks() {
    init_logger();
    let (host, mut device) = MemoryPort::pair();
    let image = FirmwareImage::from_bytes(b"OTA-image!".to_vec(), &limits()).unwrap();

    let device_thread = thread::spawn(move || {
        let cfg = bootloader_config();
        let mut boot = Bootloader::new(MemoryFlash::for_region(cfg.region), cfg).unwrap();

        // Record every exchange to check the response sequence
        let mut exchanges = Vec::new();
        while exchanges.len() < 6 {
            if let Some(exchange) = boot.poll(&mut device).unwrap() {
                exchanges.push(exchange);
            }
        }
        (boot, exchanges)
    });

    let mut uploader = Uploader::with_config(host, upload_config());
    let mut progress = Vec::new();
    uploader
        .upload(&image, |sent, total| progress.push((sent, total)))
        .unwrap();
    assert_eq!(progress, [(4, 10), (8, 10), (10, 10)]);

    let (boot, exchanges) = device_thread.join().unwrap();
    assert!(exchanges.iter().all(|e| e.status == otaflash::Status::Ack));
    let events: Vec<_> = exchanges.iter().map(|e| e.event).collect();
    assert_eq!(events[0], Some(Event::SessionOpened));
    assert_eq!(events[4], Some(Event::ImageReceived { total: 10 }));
    assert_eq!(
        events[5],
        Some(Event::SessionCompleted {
            size: 10,
            crc: crc32(b"OTA-image!")
        })
    );
    assert_eq!(boot.machine().state(), State::Idle);

    let flash = boot.into_flash();
    assert_eq!(flash.slice(BASE, 10).unwrap(), b"OTA-image!");
    assert_eq!(flash.slice(BASE + 10, 1).unwrap(), [0xFF]);
    assert_eq!(flash.erase_count(), 1);
}

#[test]
fn serve_returns_completed_session() {
    init_logger();
    let (host, mut device) = MemoryPort::pair();
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let image = FirmwareImage::from_bytes(data.clone(), &limits()).unwrap();

    let device_thread = thread::spawn(move || {
        let cfg = bootloader_config();
        let mut boot = Bootloader::new(MemoryFlash::for_region(cfg.region), cfg).unwrap();
        let outcome = boot.serve(&mut device).unwrap();
        (outcome, boot.into_flash())
    });

    let mut uploader = Uploader::with_config(host, upload_config());
    uploader.upload(&image, |_, _| {}).unwrap();

    let (outcome, flash) = device_thread.join().unwrap();
    assert_eq!(
        outcome,
        SessionOutcome::Completed {
            size: 1000,
            crc: crc32(&data)
        }
    );
    assert_eq!(flash.slice(BASE, 1000).unwrap(), &data[..]);
}

#[test]
fn oversized_image_is_refused_at_header() {
    init_logger();
    let (host, mut device) = MemoryPort::pair();
    // Host allows more than the device region holds
    let image = FirmwareImage::from_bytes(vec![0x5A; 5000], &ProtocolLimits::default()).unwrap();

    let device_thread = thread::spawn(move || {
        let cfg = bootloader_config();
        let mut boot = Bootloader::new(MemoryFlash::for_region(cfg.region), cfg).unwrap();
        boot.poll(&mut device).unwrap();
        boot.poll(&mut device).unwrap();
        boot
    });

    let mut uploader = Uploader::with_config(host, upload_config());
    let err = uploader.upload(&image, |_, _| {}).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Header));
    assert!(matches!(err, Error::Transfer { ref source, .. } if matches!(**source, Error::Nack)));

    let boot = device_thread.join().unwrap();
    assert_eq!(boot.machine().state(), State::AwaitingHeader);
    assert_eq!(boot.into_flash().erase_count(), 0);
}

#[test]
fn host_abort_ends_session() {
    init_logger();
    let (mut host, mut device) = MemoryPort::pair();

    let device_thread = thread::spawn(move || {
        let cfg = bootloader_config();
        let mut boot = Bootloader::new(MemoryFlash::for_region(cfg.region), cfg).unwrap();
        boot.serve(&mut device).unwrap()
    });

    let policy = ReadPolicy::with_timeout(Duration::from_secs(2));
    let mut reader = otaflash::protocol::FrameReader::new();
    for (frame, reply) in [
        (Frame::Command(Command::Start), Frame::ack()),
        (Frame::Command(Command::Abort), Frame::nack()),
    ] {
        otaflash::protocol::write_frame(&mut host, &frame, Duration::ZERO).unwrap();
        assert_eq!(reader.read(&mut host, &policy).unwrap(), reply);
    }

    assert_eq!(device_thread.join().unwrap(), SessionOutcome::Aborted);
    assert_eq!(host.pending(), 0);
    host.clear_buffers().unwrap();
}
