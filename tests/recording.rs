use std::fs;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use media_encapsuler::pvat::PvatDescription;
use media_encapsuler::{
    get_atom, get_pvat_string, AudioCodec, AudioFormat, AudioSample, EncapsulerConfig, FramePayload, FrameType,
    Location, Logger, UntimedMetadata, VideoCodec, VideoEncapsuler, VideoFrame,
};
use tempfile::tempdir;

const IDR: [u8; 20] = [
    0, 0, 0, 1, 0x67, 0x42, 0x80, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88,
];
const P: [u8; 7] = [0, 0, 0, 1, 0x41, 0x9a, 0x02];

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn h264(payload: &[u8], frame_type: FrameType, timestamp_us: u64) -> VideoFrame<'_> {
    VideoFrame {
        codec: VideoCodec::H264,
        width: 640,
        height: 480,
        frame_type,
        payload: FramePayload::Raw(payload),
        timestamp_us,
        insert_parameter_sets: false,
    }
}

fn session(path: &Path) -> VideoEncapsuler {
    VideoEncapsuler::new(
        path,
        30,
        "6F3A01",
        "2015-04-01T120000+0200",
        0x0901,
        EncapsulerConfig::default(),
        Logger::global(),
    )
    .unwrap()
}

/// `(count, delta)` pairs of an stts payload.
fn stts_runs(stts: &[u8]) -> Vec<(u32, u32)> {
    (0..be32(stts, 4) as usize)
        .map(|i| (be32(stts, 8 + i * 8), be32(stts, 12 + i * 8)))
        .collect()
}

#[test]
fn h264_gop_end_to_end() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("gop.mp4");
    let mut enc = session(&out);
    enc.add_frame(&h264(&IDR, FrameType::I, 0), None).unwrap();
    for _ in 0..10 {
        enc.add_frame(&h264(&P, FrameType::P, 0), None).unwrap();
    }
    let creation_time = enc.creation_time();
    let finished = enc.finish().unwrap();

    assert_eq!(finished, out);
    assert!(!dir.path().join("gop.mp4.tmp").exists());
    assert!(!dir.path().join("gop.mp4.meta").exists());

    let ftyp = get_atom(&out, "ftyp").unwrap();
    assert_eq!(&ftyp[..4], b"isom");

    let mdhd = get_atom(&out, "moov/trak/mdia/mdhd").unwrap();
    assert_eq!(be32(&mdhd, 12), 60_000);
    assert_eq!(be32(&mdhd, 16), 11 * (60_000 / 30));

    let stss = get_atom(&out, "moov/trak/mdia/minf/stbl/stss").unwrap();
    assert_eq!(be32(&stss, 4), 1);
    assert_eq!(be32(&stss, 8), 1);

    let stts = get_atom(&out, "moov/trak/mdia/minf/stbl/stts").unwrap();
    assert_eq!(stts_runs(&stts), vec![(11, 2000)]);

    let modified = fs::metadata(&out).unwrap().modified().unwrap();
    assert_eq!(modified, UNIX_EPOCH + Duration::from_secs(creation_time as u64));
}

#[test]
fn offsets_and_mdat_cover_the_media() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("offsets.mp4");
    let mut enc = session(&out);
    enc.add_frame(&h264(&IDR, FrameType::I, 1_000_000), None).unwrap();
    enc.add_frame(&h264(&P, FrameType::P, 1_033_333), None).unwrap();
    enc.add_frame(&h264(&P, FrameType::P, 1_100_000), None).unwrap();
    enc.finish().unwrap();

    let file = fs::read(&out).unwrap();
    let stco = get_atom(&out, "moov/trak/mdia/minf/stbl/stco").unwrap();
    let offsets: Vec<u32> = (0..be32(&stco, 4) as usize).map(|i| be32(&stco, 8 + i * 4)).collect();
    let stsz = get_atom(&out, "moov/trak/mdia/minf/stbl/stsz").unwrap();
    assert_eq!(be32(&stsz, 4), 0);
    let sizes: Vec<u32> = (0..be32(&stsz, 8) as usize).map(|i| be32(&stsz, 12 + i * 4)).collect();
    assert_eq!(sizes, vec![20, 7, 7]);

    // ftyp (32) + pvat slot (520) + mdat header region (16)
    assert_eq!(offsets, vec![568, 588, 595]);
    for pair in offsets.windows(2).zip(&sizes) {
        assert_eq!(pair.0[1], pair.0[0] + pair.1);
    }
    assert_eq!(&file[552..556], &8u32.to_be_bytes());
    assert_eq!(&file[556..560], b"free");
    assert_eq!(be32(&file, 560), 34 + 8);
    assert_eq!(&file[564..568], b"mdat");
    assert_eq!(&file[602 + 4..602 + 8], b"moov");

    let stts = get_atom(&out, "moov/trak/mdia/minf/stbl/stts").unwrap();
    assert_eq!(stts_runs(&stts), vec![(1, 2000), (1, 4000), (1, 2000)]);
    let total: u32 = stts_runs(&stts).iter().map(|r| r.0).sum();
    assert_eq!(total as usize, sizes.len());
}

#[test]
fn pvat_describes_the_recording() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("pvat.mp4");
    let mut enc = session(&out);
    enc.add_frame(&h264(&IDR, FrameType::I, 0), None).unwrap();
    enc.finish().unwrap();

    let description = PvatDescription::from_json(&get_pvat_string(&out).unwrap()).unwrap();
    assert_eq!(description.product_id, "0901");
    assert_eq!(description.uuid.as_deref(), Some("6F3A01"));
    assert_eq!(description.run_date.as_deref(), Some("2015-04-01T120000+0200"));
    assert_eq!(description.filename.as_deref(), Some("pvat.mp4"));
    assert!(description.media_date.is_some());

    let file = fs::read(&out).unwrap();
    let pvat_len = be32(&file, 32) as usize;
    assert_eq!(&file[32 + pvat_len + 4..32 + pvat_len + 8], b"free");
    assert_eq!(pvat_len + be32(&file, 32 + pvat_len) as usize, 520);
}

#[test]
fn audio_drift_is_padded_with_silence() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("audio.mp4");
    let mut enc = session(&out);
    enc.add_frame(&h264(&IDR, FrameType::I, 100_000), None).unwrap();
    let pcm = [3u8; 4096];
    enc.add_sample(&AudioSample {
        codec: AudioCodec::PcmLe,
        format: AudioFormat::S16,
        channels: 2,
        sample_rate: 48_000,
        data: &pcm,
        timestamp_us: 115_000,
    })
    .unwrap();
    enc.finish().unwrap();

    let hdlr = get_atom(&out, "moov/2:trak/mdia/hdlr").unwrap();
    assert_eq!(&hdlr[8..12], b"soun");
    let stsz = get_atom(&out, "moov/2:trak/mdia/minf/stbl/stsz").unwrap();
    assert_eq!(be32(&stsz, 4), 4);
    assert_eq!(be32(&stsz, 8), (720 * 4 + 4096) / 4);

    let stco = get_atom(&out, "moov/2:trak/mdia/minf/stbl/stco").unwrap();
    let chunk = be32(&stco, 8) as usize;
    let file = fs::read(&out).unwrap();
    assert!(file[chunk..chunk + 720 * 4].iter().all(|&b| b == 0));
    assert_eq!(file[chunk + 720 * 4], 3);
}

#[test]
fn mjpeg_uses_quicktime_brand() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("mjpeg.mov");
    let mut enc = session(&out);
    let jpeg = [0xff, 0xd8, 0xff, 0xe0, 0, 0x10, 0xff, 0xd9];
    for _ in 0..3 {
        let frame = VideoFrame {
            codec: VideoCodec::Mjpeg,
            width: 320,
            height: 240,
            frame_type: FrameType::Jpeg,
            payload: FramePayload::Raw(&jpeg),
            timestamp_us: 0,
            insert_parameter_sets: false,
        };
        enc.add_frame(&frame, None).unwrap();
    }
    enc.finish().unwrap();

    assert_eq!(&get_atom(&out, "ftyp").unwrap()[..4], b"qt  ");
    assert!(get_atom(&out, "moov/trak/mdia/minf/stbl/stss").is_err());
    let stsd = get_atom(&out, "moov/trak/mdia/minf/stbl/stsd").unwrap();
    assert_eq!(&stsd[12..16], b"jpeg");
    let stsz = get_atom(&out, "moov/trak/mdia/minf/stbl/stsz").unwrap();
    assert_eq!((be32(&stsz, 4), be32(&stsz, 8)), (8, 3));
}

#[test]
fn timed_metadata_track() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("meta.mp4");
    let mut enc = session(&out);
    enc.set_metadata_info("", "application/octet-stream", 12).unwrap();
    enc.add_frame(&h264(&IDR, FrameType::I, 0), Some(&[1; 12])).unwrap();
    enc.add_frame(&h264(&P, FrameType::P, 0), Some(&[2; 12])).unwrap();
    enc.finish().unwrap();

    let hdlr = get_atom(&out, "moov/2:trak/mdia/hdlr").unwrap();
    assert_eq!(&hdlr[8..12], b"meta");
    let cdsc = get_atom(&out, "moov/2:trak/tref/cdsc").unwrap();
    assert_eq!(cdsc, 1u32.to_be_bytes());
    let stsz = get_atom(&out, "moov/2:trak/mdia/minf/stbl/stsz").unwrap();
    assert_eq!((be32(&stsz, 4), be32(&stsz, 8)), (12, 2));
    let stco = get_atom(&out, "moov/2:trak/mdia/minf/stbl/stco").unwrap();
    let file = fs::read(&out).unwrap();
    assert_eq!(file[be32(&stco, 8) as usize], 1);
    assert_eq!(file[be32(&stco, 12) as usize], 2);
}

#[test]
fn untimed_metadata_lands_in_udta_and_meta() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("untimed.mp4");
    let mut enc = session(&out);
    enc.add_frame(&h264(&IDR, FrameType::I, 0), None).unwrap();
    enc.set_untimed_metadata(UntimedMetadata {
        maker: "Parrot".into(),
        model: "Bebop".into(),
        title: "Flight".into(),
        ..Default::default()
    })
    .unwrap();
    enc.set_gps_infos(Location::new(48.8788, 2.3671, 35.0)).unwrap();
    enc.finish().unwrap();

    let xyz = get_atom(&out, "moov/udta/©xyz").unwrap();
    assert!(String::from_utf8_lossy(&xyz).contains("+48.8788+002.3671/"));
    let ilst = get_atom(&out, "moov/udta/meta").unwrap();
    assert!(ilst.windows(6).any(|w| w == b"Flight"));
    let keys = get_atom(&out, "moov/meta/keys").unwrap();
    assert!(keys.windows(26).any(|w| w == b"com.apple.quicktime.artist"));
}
