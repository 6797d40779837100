use std::fs;
use std::io::Cursor;
use std::path::Path;

use media_encapsuler::pvat::PvatDescription;
use media_encapsuler::{
    add_pvat_atom, get_atom, get_pvat_string, rewrite_pvat_dates, video_timescale, AudioCodec, AudioFormat,
    AudioSample, EncapsulerConfig, EncapsulerError, FramePayload, FrameType, Logger, VideoCodec, VideoEncapsuler,
    VideoFrame,
};
use tempfile::tempdir;

const IDR: [u8; 20] = [
    0, 0, 0, 1, 0x67, 0x42, 0x80, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88,
];

fn record(output: &Path, fps: u32) {
    let mut enc = VideoEncapsuler::new(
        output,
        fps,
        "ABCDEF",
        "2015-04-01T120000+0200",
        0x0901,
        EncapsulerConfig::default(),
        Logger::global(),
    )
    .unwrap();
    let frame = VideoFrame {
        codec: VideoCodec::H264,
        width: 640,
        height: 480,
        frame_type: FrameType::I,
        payload: FramePayload::Raw(&IDR),
        timestamp_us: 0,
        insert_parameter_sets: false,
    };
    enc.add_frame(&frame, None).unwrap();
    let pcm = [0u8; 640];
    enc.add_sample(&AudioSample {
        codec: AudioCodec::PcmLe,
        format: AudioFormat::S16,
        channels: 1,
        sample_rate: 16_000,
        data: &pcm,
        timestamp_us: 0,
    })
    .unwrap();
    enc.finish().unwrap();
}

#[test]
fn indexed_paths_reach_every_track() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("tracks.mp4");
    record(&out, 30);

    let first = get_atom(&out, "moov/1:trak/mdia/hdlr").unwrap();
    let implicit = get_atom(&out, "moov/trak/mdia/hdlr").unwrap();
    assert_eq!(first, implicit);
    assert_eq!(&first[8..12], b"vide");

    let audio = get_atom(&out, "moov/2:trak/mdia/mdhd").unwrap();
    assert_eq!(&audio[12..16], &16_000u32.to_be_bytes());

    assert!(matches!(
        get_atom(&out, "moov/3:trak/mdia"),
        Err(EncapsulerError::AtomNotFound(_))
    ));
    assert!(matches!(get_atom(&out, "moov/nope"), Err(EncapsulerError::AtomNotFound(_))));
}

#[test]
fn timescale_comes_from_the_video_track() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("ts.mp4");
    record(&out, 24);
    assert_eq!(video_timescale(&out).unwrap(), 48_000);
}

#[test]
fn dates_are_patched_in_place() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("dates.mp4");
    record(&out, 30);
    let before = fs::read(&out).unwrap();

    rewrite_pvat_dates(&out, "2017-01-01T000000+0000").unwrap();

    let after = fs::read(&out).unwrap();
    assert_eq!(before.len(), after.len());
    let description = PvatDescription::from_json(&get_pvat_string(&out).unwrap()).unwrap();
    assert_eq!(description.run_date.as_deref(), Some("2017-01-01T000000+0000"));
    assert_eq!(description.media_date.as_deref(), Some("2017-01-01T000000+0000"));
    assert_eq!(description.uuid.as_deref(), Some("ABCDEF"));

    // Everything after the pvat slot is untouched.
    assert_eq!(before[32 + 520..], after[32 + 520..]);
    assert!(get_atom(&out, "moov/mvhd").is_ok());
}

#[test]
fn oversized_date_is_rejected() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("big.mp4");
    record(&out, 30);
    let before = fs::read(&out).unwrap();

    let date = "9".repeat(600);
    assert!(matches!(
        rewrite_pvat_dates(&out, &date),
        Err(EncapsulerError::BadParameter(_))
    ));
    assert_eq!(before, fs::read(&out).unwrap());
}

#[test]
fn standalone_pvat_box() {
    let mut buf = Cursor::new(Vec::new());
    let len = add_pvat_atom(&mut buf, 0x0914, "2016-06-06T060606+0000", "").unwrap();
    let bytes = buf.into_inner();

    assert_eq!(len as usize, bytes.len());
    assert_eq!(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize, bytes.len());
    assert_eq!(&bytes[4..8], b"pvat");
    let description = PvatDescription::from_json(std::str::from_utf8(&bytes[8..]).unwrap()).unwrap();
    assert_eq!(description.product_id, "0914");
    assert_eq!(description.run_date.as_deref(), Some("2016-06-06T060606+0000"));
    assert!(description.media_date.is_none());
}
