//! Flashing sessions against the simulated bootloader.

use std::io::Write;

use picloader::config::{ByteSeq, ResetKind, Timeouts};
use picloader::format::{read_firmware_from_file, write_ihex};
use picloader::progress::{NoProgress, Progress, ProgressObserver};
use picloader::transport::SimulatedDevice;
use picloader::{CancelToken, Chip, Config, Error, FirmwareImage, FlashResult, Session, SessionState};

/// 256 words of flash, 8 word (16 byte) pages.
fn small_chip() -> Chip {
    Chip::new("TEST", 0x31, "16F8XX", 0x100, 8, 100)
}

fn config() -> Config {
    let mut config = Config::default();
    config.timeouts = Timeouts::uniform(5);
    config.flash.relocate_reset_vector = false;
    config
}

fn image(start: u32, len: u32) -> FirmwareImage {
    (start..start + len).map(|a| (a, (a * 7) as u8)).collect()
}

fn session(dev: SimulatedDevice, config: &Config) -> Session<SimulatedDevice> {
    Session::new(dev, config).unwrap().with_chip(small_chip())
}

fn flash(session: &mut Session<SimulatedDevice>, image: &FirmwareImage) -> FlashResult {
    session.run(image, &mut NoProgress, &CancelToken::new())
}

#[derive(Default)]
struct Recorder(Vec<Progress>);

impl ProgressObserver for Recorder {
    fn on_progress(&mut self, progress: &Progress) {
        self.0.push(*progress);
    }
}

struct CancelAfter {
    page: usize,
    token: CancelToken,
}

impl ProgressObserver for CancelAfter {
    fn on_progress(&mut self, progress: &Progress) {
        if progress.page == self.page {
            self.token.cancel();
        }
    }
}

#[test]
fn two_pages_are_written() {
    let img = image(0, 32);
    let mut session = session(SimulatedDevice::new(0x31), &config());
    let result = flash(&mut session, &img);
    assert!(matches!(
        result,
        FlashResult::Success {
            pages_written: 2,
            bytes_written: 32
        }
    ));
    assert_eq!(result.exit_code(), 0);

    let dev = session.into_transport();
    assert_eq!(dev.stats().identify_requests, 1);
    assert_eq!(dev.stats().write_frames, 2);
    assert_eq!(dev.stats().written_pages, vec![0x00, 0x10]);
    for (address, byte) in img.iter() {
        assert_eq!(dev.flash().get(&address), Some(&byte));
    }
}

#[test]
fn silent_bootloader_fails_sync_without_writing() {
    let mut config = config();
    config.retries.sync_attempts = 5;
    let mut session = session(SimulatedDevice::new(0x31).not_listening(), &config);
    let result = flash(&mut session, &image(0, 32));
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: None,
            pages_written: 0,
            reason: Error::SyncFailed { attempts: 5 }
        }
    ));
    assert_eq!(result.exit_code(), 4);
    assert_eq!(session.state(), SessionState::Failed);

    let dev = session.into_transport();
    assert_eq!(dev.stats().identify_requests, 5);
    assert_eq!(dev.stats().write_frames, 0);
}

#[test]
fn write_attempts_are_bounded_exactly() {
    let mut config = config();
    config.retries.page_attempts = 4;
    let dev = SimulatedDevice::new(0x31).with_write_timeouts(usize::MAX);
    let mut session = session(dev, &config);
    let result = flash(&mut session, &image(0, 32));
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: Some(0),
            pages_written: 0,
            reason: Error::PageWriteFailed {
                address: 0,
                attempts: 4
            }
        }
    ));
    assert_eq!(session.into_transport().stats().write_frames, 4);
}

#[test]
fn success_is_every_page_acknowledged() {
    for naks in 0..6 {
        let dev = SimulatedDevice::new(0x31).with_write_naks(naks);
        let mut session = session(dev, &config());
        let result = flash(&mut session, &image(0, 48));
        assert_eq!(result.is_success(), naks < 3, "{} NAKs", naks);
        if result.is_success() {
            assert_eq!(result.pages_written(), 3);
        } else {
            assert_eq!(result.pages_written(), 0);
        }
    }
}

#[test]
fn corrupted_frame_is_retried() {
    // length byte of the second frame
    let dev = SimulatedDevice::new(0x31).with_corrupted_write(1, 20);
    let img = image(0, 32);
    let mut session = session(dev, &config());
    assert!(flash(&mut session, &img).is_success());

    let dev = session.into_transport();
    assert_eq!(dev.stats().write_frames, 3);
    assert_eq!(dev.stats().written_pages, vec![0x00, 0x10]);
    for (address, byte) in img.iter() {
        assert_eq!(dev.flash().get(&address), Some(&byte));
    }
}

#[test]
fn cancellation_stops_before_next_page() {
    let token = CancelToken::new();
    let mut observer = CancelAfter {
        page: 2,
        token: token.clone(),
    };
    let mut session = session(SimulatedDevice::new(0x31), &config());
    let result = session.run(&image(0, 64), &mut observer, &token);
    assert!(matches!(result, FlashResult::Cancelled { pages_written: 2 }));
    assert_eq!(result.exit_code(), 130);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(session.pages_written(), 2);
    assert_eq!(session.into_transport().stats().written_pages, vec![0x00, 0x10]);
}

#[test]
fn cancelled_before_start_sends_nothing() {
    let token = CancelToken::new();
    token.cancel();
    let mut session = session(SimulatedDevice::new(0x31), &config());
    let result = session.run(&image(0, 32), &mut NoProgress, &token);
    assert!(matches!(result, FlashResult::Cancelled { pages_written: 0 }));
    assert_eq!(session.into_transport().stats().identify_requests, 0);
}

#[test]
fn verify_catches_cells_that_do_not_program() {
    let mut config = config();
    config.flash.verify = true;
    // 0x12 holds 0x7e
    let dev = SimulatedDevice::new(0x31).with_stuck_bits(0x12, 0x40);
    let mut session = session(dev, &config);
    let result = flash(&mut session, &image(0, 32));
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: Some(1),
            pages_written: 1,
            reason: Error::VerifyMismatch {
                address: 0x10,
                offset: 2,
                expected: 0x7e,
                found: 0x3e
            }
        }
    ));
    assert_eq!(result.exit_code(), 8);
}

#[test]
fn verify_passes_on_healthy_device() {
    let mut config = config();
    config.flash.verify = true;
    let mut session = session(SimulatedDevice::new(0x31), &config);
    assert!(flash(&mut session, &image(0x20, 40)).is_success());
    let dev = session.into_transport();
    assert_eq!(dev.stats().read_frames, 3);
    assert_eq!(dev.stats().written_pages, vec![0x20, 0x30, 0x40]);
}

#[test]
fn oversized_image_is_rejected_before_io() {
    let img: FirmwareImage = image(0, 16).iter().chain([(0x200, 0x00)]).collect();
    let mut session = session(SimulatedDevice::new(0x31), &config());
    let result = flash(&mut session, &img);
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: None,
            reason: Error::ImageOutOfRange {
                address: 0x200,
                limit: 0x138
            },
            ..
        }
    ));
    assert_eq!(result.exit_code(), 6);
    assert_eq!(
        session.into_transport().stats(),
        &picloader::transport::Stats::default()
    );
}

#[test]
fn oversized_image_for_identified_chip_is_rejected_before_first_page() {
    let img: FirmwareImage = image(0, 16).iter().chain([(0x3f40, 0x00)]).collect();
    let mut session = Session::new(SimulatedDevice::new(0x31), &config()).unwrap();
    let result = flash(&mut session, &img);
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: None,
            reason: Error::ImageOutOfRange {
                address: 0x3f40,
                limit: 0x3f38
            },
            ..
        }
    ));
    let dev = session.into_transport();
    assert_eq!(dev.stats().identify_requests, 1);
    assert_eq!(dev.stats().write_frames, 0);
}

#[test]
fn empty_image_completes_without_io() {
    let mut session = session(SimulatedDevice::new(0x31).not_listening(), &config());
    let result = flash(&mut session, &FirmwareImage::default());
    assert!(matches!(
        result,
        FlashResult::Success {
            pages_written: 0,
            bytes_written: 0
        }
    ));
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(session.into_transport().stats().identify_requests, 0);
}

#[test]
fn configured_device_must_match_the_bootloader() {
    let mut config = config();
    config.device.name = Some("PIC16F88".into());
    let mut session = Session::new(SimulatedDevice::new(0x31), &config).unwrap();
    let result = flash(&mut session, &image(0, 32));
    assert!(matches!(
        result,
        FlashResult::Failed {
            reason: Error::DeviceMismatch { found: 0x31, .. },
            ..
        }
    ));
    assert_eq!(session.into_transport().stats().write_frames, 0);
}

#[test]
fn reset_sequence_brings_up_the_bootloader() {
    let mut config = config();
    config.reset.strategy = ResetKind::Sequence;
    config.reset.sequence = Some(ByteSeq::Bytes(b"\x55\xaaBOOT".to_vec()));
    config.reset.reply = Some(ByteSeq::Text("OK".into()));
    let dev = SimulatedDevice::new(0x31).running_application(b"\x55\xaaBOOT", b"OK");
    let mut session = session(dev, &config);
    assert!(flash(&mut session, &image(0, 32)).is_success());

    let dev = session.into_transport();
    assert_eq!(dev.stats().reset_sequences, 1);
    // the probe went to the application, only the sync reached the bootloader
    assert_eq!(dev.stats().identify_requests, 1);
    assert_eq!(dev.stats().written_pages, vec![0x00, 0x10]);
}

#[test]
fn unanswered_reset_sequence_fails() {
    let mut config = config();
    config.reset.strategy = ResetKind::Sequence;
    config.reset.sequence = Some(ByteSeq::Text("RST".into()));
    config.reset.reply = Some(ByteSeq::Text("OK".into()));
    config.reset.attempts = 2;
    let dev = SimulatedDevice::new(0x31).running_application_without_reset_hook();
    let mut session = session(dev, &config);
    let result = flash(&mut session, &image(0, 32));
    assert!(matches!(
        result,
        FlashResult::Failed {
            reason: Error::ResetFailed { attempts: 2 },
            ..
        }
    ));
    assert_eq!(result.exit_code(), 3);
}

#[test]
fn active_bootloader_skips_reset() {
    let mut config = config();
    config.reset.strategy = ResetKind::Sequence;
    config.reset.sequence = Some(ByteSeq::Text("RST".into()));
    let mut session = session(SimulatedDevice::new(0x31), &config);
    assert!(flash(&mut session, &image(0, 32)).is_success());

    let dev = session.into_transport();
    assert_eq!(dev.stats().reset_sequences, 0);
    assert_eq!(dev.stats().identify_requests, 1);
}

#[test]
fn dtr_reset_restarts_the_device() {
    let mut config = config();
    config.reset.strategy = ResetKind::Dtr;
    config.reset.dtr_pulse_ms = 0;
    config.reset.settle_ms = 0;
    let dev = SimulatedDevice::new(0x31).running_application_without_reset_hook();
    let mut session = session(dev, &config);
    assert!(flash(&mut session, &image(0, 32)).is_success());
    assert_eq!(session.into_transport().stats().dtr_resets, 1);
}

#[test]
fn dtr_reset_goes_to_the_reset_line() {
    let mut config = config();
    config.reset.strategy = ResetKind::Dtr;
    config.reset.dtr_pulse_ms = 0;
    config.reset.settle_ms = 0;
    let dev = SimulatedDevice::new(0x31).running_application_without_reset_hook();
    let mut session = session(dev, &config).with_reset_line(Box::new(SimulatedDevice::new(0x31)));
    let result = flash(&mut session, &image(0, 32));
    // the line is not wired to this device, so it keeps running its application
    assert!(matches!(
        result,
        FlashResult::Failed {
            reason: Error::SyncFailed { .. },
            ..
        }
    ));
    assert_eq!(session.into_transport().stats().dtr_resets, 0);
}

#[test]
fn progress_is_reported_per_page() {
    let mut recorder = Recorder::default();
    let mut session = session(SimulatedDevice::new(0x31), &config());
    // 24 image bytes over 2 pages
    let img = image(0x08, 24);
    assert!(session.run(&img, &mut recorder, &CancelToken::new()).is_success());

    let pages: Vec<(usize, usize, u32)> = recorder
        .0
        .iter()
        .map(|p| (p.page, p.total_pages, p.address))
        .collect();
    assert_eq!(pages, vec![(1, 2, 0x00), (2, 2, 0x10)]);
    let last = recorder.0.last().unwrap();
    assert_eq!(last.bytes_written, 32);
    assert_eq!(last.image_bytes_done, 24);
    assert_eq!(last.percentage(), 100);
    assert_eq!(recorder.0[0].percentage(), 33);
}

#[test]
fn reset_vector_is_relocated_on_the_device() {
    let mut config = config();
    config.flash.relocate_reset_vector = true;
    // goto 0x0005; nop
    let img: FirmwareImage = [(0, 0x05), (1, 0x28), (2, 0x00), (3, 0x00)].into_iter().collect();
    let mut session = Session::new(SimulatedDevice::new(0x31), &config).unwrap();
    assert!(flash(&mut session, &img).is_success());

    let dev = session.into_transport();
    assert_eq!(dev.stats().written_pages, vec![0x0000, 0x3f00]);
    let head: Vec<u8> = (0..6).map(|a| dev.flash()[&a]).collect();
    assert_eq!(head, vec![0x1f, 0x30, 0x8a, 0x00, 0xa0, 0x2f]);
    let moved: Vec<u8> = (0x3f38..0x3f3e).map(|a| dev.flash()[&a]).collect();
    assert_eq!(moved, vec![0x8a, 0x01, 0x05, 0x28, 0x00, 0x00]);
}

#[test]
fn hex_file_is_flashed_as_read() {
    let img: FirmwareImage = image(0, 20)
        .iter()
        .chain(image(0x60, 5).iter())
        .chain([(0x400e, 0x72), (0x400f, 0x3f)])
        .collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(write_ihex(&img).unwrap().as_bytes()).unwrap();

    let loaded = read_firmware_from_file(file.path()).unwrap();
    assert_eq!(loaded, img);

    let mut session = session(SimulatedDevice::new(0x31), &config());
    assert!(flash(&mut session, &loaded).is_success());
    let dev = session.into_transport();
    // configuration words are not sent
    assert_eq!(dev.stats().written_pages, vec![0x00, 0x10, 0x60]);
    assert_eq!(dev.flash().get(&0x13), Some(&(0x13 * 7)));
    assert_eq!(dev.flash().get(&0x14), Some(&0xff));
}

#[test]
fn config_only_image_writes_nothing_even_with_relocation() {
    let mut config = config();
    config.flash.relocate_reset_vector = true;
    let img: FirmwareImage = [(0x400e, 0x72), (0x400f, 0x3f)].into_iter().collect();
    let mut session = Session::new(SimulatedDevice::new(0x31), &config).unwrap();
    let result = flash(&mut session, &img);
    assert!(matches!(
        result,
        FlashResult::Success {
            pages_written: 0,
            bytes_written: 0
        }
    ));

    let dev = session.into_transport();
    assert_eq!(dev.stats().write_frames, 0);
    assert!(dev.stats().written_pages.is_empty());
}

#[test]
fn io_error_on_write_is_not_retried() {
    let dev = SimulatedDevice::new(0x31).with_io_error_on_write(0);
    let mut session = session(dev, &config());
    let result = flash(&mut session, &image(0, 32));
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: Some(0),
            pages_written: 0,
            reason: Error::Io(_)
        }
    ));
    assert_eq!(result.exit_code(), 2);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(session.into_transport().stats().write_frames, 1);
}

#[test]
fn io_error_after_first_page_keeps_the_count() {
    let dev = SimulatedDevice::new(0x31).with_io_error_on_write(1);
    let mut session = session(dev, &config());
    let result = flash(&mut session, &image(0, 48));
    assert!(matches!(
        result,
        FlashResult::Failed {
            page: Some(1),
            pages_written: 1,
            reason: Error::Io(_)
        }
    ));
    let dev = session.into_transport();
    assert_eq!(dev.stats().write_frames, 2);
    assert_eq!(dev.stats().written_pages, vec![0x00]);
}

#[test]
fn unrelocated_last_page_erases_the_start_slot() {
    let img: FirmwareImage = [(0x3f00, 0x01)].into_iter().collect();
    let mut session = Session::new(SimulatedDevice::new(0x31), &config()).unwrap();
    assert!(flash(&mut session, &img).is_success());

    let dev = session.into_transport();
    assert_eq!(dev.stats().written_pages, vec![0x3f00]);
    assert_eq!(dev.flash()[&0x3f00], 0x01);
    assert!((0x3f38..0x3f40).all(|a| dev.flash()[&a] == 0xff));
}
