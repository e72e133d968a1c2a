//! End-to-end code stream scenarios: encode with this crate, decode
//! with this crate, and check the reconstruction against the source
//! samples.

use jp2k::{
  compress, decompress, CblkSty, Codestream, CompressParams, DecompressParams, Error, Image,
  ImageComp, Rect,
};

fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn xorshift(state: &mut u32) -> u32 {
  let mut x = *state;
  x ^= x << 13;
  x ^= x >> 17;
  x ^= x << 5;
  *state = x;
  x
}

fn grey_image(w: u32, h: u32, seed: u32) -> Image {
  let mut s = seed;
  Image {
    bounds: Rect::new(0, 0, w, h),
    comps: vec![ImageComp {
      dx: 1,
      dy: 1,
      rect: Rect::new(0, 0, w, h),
      precision: 8,
      signed: false,
      data: (0..w * h).map(|_| (xorshift(&mut s) & 0xff) as i32).collect(),
      ..Default::default()
    }],
    packing: None,
  }
}

fn rgb_image(w: u32, h: u32, seed: u32) -> Image {
  let mut s = seed;
  let mut mk = |_: u32| ImageComp {
    dx: 1,
    dy: 1,
    rect: Rect::new(0, 0, w, h),
    precision: 8,
    signed: false,
    data: (0..w * h).map(|_| (xorshift(&mut s) & 0xff) as i32).collect(),
    ..Default::default()
  };
  Image {
    bounds: Rect::new(0, 0, w, h),
    comps: vec![mk(0), mk(1), mk(2)],
    packing: None,
  }
}

fn assert_images_equal(a: &Image, b: &Image) {
  assert_eq!(a.comps.len(), b.comps.len());
  for (ca, cb) in a.comps.iter().zip(b.comps.iter()) {
    assert_eq!(ca.rect, cb.rect, "component rects differ");
    assert_eq!(ca.data, cb.data, "component samples differ");
  }
}

#[test]
fn s1_single_tile_grey_lossless() {
  init_logging();
  let img = grey_image(32, 32, 0xa5a5_0001);
  let params = CompressParams {
    num_resolutions: 1,
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  assert!(stream.starts_with(&[0xff, 0x4f, 0xff, 0x51]));
  let out = decompress(&stream, &DecompressParams::default()).unwrap();
  assert_eq!(out.comps[0].rect, Rect::new(0, 0, 32, 32));
  assert_eq!(out.comps[0].data, img.comps[0].data);
}

#[test]
fn s1_multiresolution_grey_lossless() {
  init_logging();
  let img = grey_image(57, 43, 0xa5a5_0002);
  let params = CompressParams {
    num_resolutions: 4,
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  let out = decompress(&stream, &DecompressParams::default()).unwrap();
  assert_eq!(out.comps[0].data, img.comps[0].data);
}

#[test]
fn s2_rgb_two_tiles_reversible_mct() {
  init_logging();
  let img = rgb_image(64, 64, 0xbeef_0001);
  let params = CompressParams {
    num_resolutions: 3,
    tile_size: Some((32, 64)),
    mct: Some(true),
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  let out = decompress(&stream, &DecompressParams::default()).unwrap();
  assert_images_equal(&img, &out);
}

#[test]
fn s3_mode_switches_roundtrip() {
  init_logging();
  let img = grey_image(16, 16, 0xc0de_0003);
  let params = CompressParams {
    num_resolutions: 2,
    cblk_expn: jp2k::Point::new(4, 4),
    cblk_sty: CblkSty::LAZY | CblkSty::TERMALL | CblkSty::SEGSYM,
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  let out = decompress(&stream, &DecompressParams::default()).unwrap();
  assert_eq!(out.comps[0].data, img.comps[0].data);
}

#[test]
fn s4_differential_layer_increment_equals_from_scratch() {
  init_logging();
  let img = grey_image(64, 64, 0xd1ff_0004);
  let params = CompressParams {
    num_resolutions: 3,
    layer_ratios: vec![40.0, 20.0, 10.0, 5.0, 0.0],
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();

  // Differential: three layers, then one more on the same tile cache.
  let mut cs = Codestream::new(&stream).unwrap();
  let three = cs
    .decompress(&DecompressParams {
      tile_index: Some(0),
      layers: Some(3),
      ..Default::default()
    })
    .unwrap();
  let four = cs
    .decompress(&DecompressParams {
      tile_index: Some(0),
      layers: Some(4),
      ..Default::default()
    })
    .unwrap();

  // From scratch for both layer counts.
  let mut fresh3 = Codestream::new(&stream).unwrap();
  let want3 = fresh3
    .decompress(&DecompressParams {
      tile_index: Some(0),
      layers: Some(3),
      ..Default::default()
    })
    .unwrap();
  let mut fresh4 = Codestream::new(&stream).unwrap();
  let want4 = fresh4
    .decompress(&DecompressParams {
      tile_index: Some(0),
      layers: Some(4),
      ..Default::default()
    })
    .unwrap();

  assert_images_equal(&three, &want3);
  assert_images_equal(&four, &want4);
}

#[test]
fn s5_region_decode_matches_full_decode_window() {
  init_logging();
  let img = grey_image(512, 512, 0x5e51_0005);
  let params = CompressParams {
    num_resolutions: 5,
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();

  let full = decompress(&stream, &DecompressParams::default()).unwrap();
  let windowed = decompress(
    &stream,
    &DecompressParams {
      region_normalised: Some([0.25, 0.25, 0.75, 0.75]),
      whole_tile: false,
      ..Default::default()
    },
  )
  .unwrap();

  let r = windowed.comps[0].rect;
  assert_eq!(r, Rect::new(128, 128, 384, 384));
  let w = r.width() as usize;
  for y in 0..r.height() as usize {
    for x in 0..w {
      let want = full.comps[0].data[(y + 128) * 512 + x + 128];
      let got = windowed.comps[0].data[y * w + x];
      assert_eq!(got, want, "window sample ({}, {})", x, y);
    }
  }
}

#[test]
fn s6_corrupt_tlm_keeps_first_tile() {
  init_logging();
  let img = grey_image(64, 32, 0x7137_0006);
  let params = CompressParams {
    num_resolutions: 2,
    tile_size: Some((32, 32)),
    write_tlm: true,
    ..Default::default()
  };
  let mut stream = compress(&img, &params).unwrap();

  // Find the second SOT and damage its Psot field.
  let mut sots = Vec::new();
  let mut i = 0;
  while i + 12 <= stream.len() {
    if stream[i] == 0xff && stream[i + 1] == 0x90 {
      sots.push(i);
      // Skip the whole tile part so bodies cannot fake an SOT.
      let psot = u32::from_be_bytes([
        stream[i + 6],
        stream[i + 7],
        stream[i + 8],
        stream[i + 9],
      ]) as usize;
      i += psot.max(12);
    } else {
      i += 1;
    }
  }
  assert_eq!(sots.len(), 2, "expected exactly two tile parts");
  let second = sots[1];
  stream[second + 9] = stream[second + 9].wrapping_add(1);

  let mut cs = Codestream::new(&stream).unwrap();
  let out = cs.decompress(&DecompressParams::default()).unwrap();
  assert!(
    cs.tile_errors
      .iter()
      .any(|(_, e)| matches!(e, Error::CorruptTlm(_))),
    "expected a corrupt TLM record, got {:?}",
    cs.tile_errors
  );
  // First tile's pixels must be intact.
  for y in 0..32usize {
    for x in 0..32usize {
      assert_eq!(
        out.comps[0].data[y * 64 + x],
        img.comps[0].data[y * 64 + x],
        "first tile sample ({}, {})",
        x,
        y
      );
    }
  }
}

#[test]
fn reduce_halves_output_dimensions() {
  init_logging();
  let img = grey_image(64, 64, 0x0bad_0007);
  let params = CompressParams {
    num_resolutions: 3,
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  let out = decompress(
    &stream,
    &DecompressParams {
      reduce: 1,
      ..Default::default()
    },
  )
  .unwrap();
  assert_eq!(out.comps[0].rect, Rect::new(0, 0, 32, 32));
}

#[test]
fn irreversible_pipeline_is_visually_close() {
  init_logging();
  let img = grey_image(64, 64, 0x1055_0008);
  let params = CompressParams {
    num_resolutions: 3,
    reversible: false,
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  let out = decompress(&stream, &DecompressParams::default()).unwrap();
  let mut err2 = 0f64;
  for (a, b) in img.comps[0].data.iter().zip(out.comps[0].data.iter()) {
    let d = (*a - *b) as f64;
    err2 += d * d;
  }
  let rmse = (err2 / img.comps[0].data.len() as f64).sqrt();
  assert!(rmse < 4.0, "rmse {}", rmse);
}

#[test]
fn jp2_wrapper_roundtrip() {
  init_logging();
  let img = grey_image(24, 24, 0x2222_0009);
  let params = CompressParams {
    num_resolutions: 2,
    ..Default::default()
  };
  let wrapped = jp2k::compress_jp2(&img, &params).unwrap();
  assert!(wrapped.starts_with(&jp2k::JP2_RFC3745_MAGIC));
  let out = decompress(&wrapped, &DecompressParams::default()).unwrap();
  assert_eq!(out.comps[0].data, img.comps[0].data);
}

#[test]
fn truncated_stream_still_returns_leading_tiles() {
  init_logging();
  let img = grey_image(64, 32, 0x3333_000a);
  let params = CompressParams {
    num_resolutions: 2,
    tile_size: Some((32, 32)),
    ..Default::default()
  };
  let stream = compress(&img, &params).unwrap();
  // Chop the stream inside the second tile part.
  let mut sots = Vec::new();
  let mut i = 0;
  while i + 12 <= stream.len() {
    if stream[i] == 0xff && stream[i + 1] == 0x90 {
      sots.push(i);
      let psot = u32::from_be_bytes([
        stream[i + 6],
        stream[i + 7],
        stream[i + 8],
        stream[i + 9],
      ]) as usize;
      i += psot.max(12);
    } else {
      i += 1;
    }
  }
  let cut = sots[1] + (stream.len() - sots[1]) / 2;
  let truncated = &stream[..cut];
  let mut cs = Codestream::new(truncated).unwrap();
  let out = cs.decompress(&DecompressParams::default()).unwrap();
  for y in 0..32usize {
    for x in 0..32usize {
      assert_eq!(out.comps[0].data[y * 64 + x], img.comps[0].data[y * 64 + x]);
    }
  }
}
