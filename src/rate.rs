//! Rate-distortion layer allocation.
//!
//! Every code block contributes a staircase of `(rate, distortion)`
//! truncation points, one per coding pass. Layers are cut by a
//! Lagrangian threshold on the distortion-rate slope, found by
//! bisection against the caller's cumulative byte targets.

use crate::canvas::{BlockLayer, CodeblockEnc};
use crate::error::{Error, Result};

/// Truncation points that survive the convex-hull filter: slopes must
/// strictly decrease along the pass sequence.
fn hull_points(blk: &CodeblockEnc) -> Vec<usize> {
  let enc = match &blk.enc {
    Some(e) => e,
    None => return Vec::new(),
  };
  let mut pts: Vec<usize> = Vec::new();
  for p in 0..enc.passes.len() {
    loop {
      let (r_prev, d_prev) = match pts.last() {
        Some(&q) => (enc.passes[q].rate as f64, enc.passes[q].distortion),
        None => (0.0, 0.0),
      };
      let r = enc.passes[p].rate as f64;
      let d = enc.passes[p].distortion;
      if r <= r_prev {
        // A pass that adds no bytes subsumes its predecessor.
        if d >= d_prev && !pts.is_empty() {
          pts.pop();
          continue;
        }
        break;
      }
      let slope = (d - d_prev) / (r - r_prev);
      // Drop hull points whose slope is not better than this one.
      if let Some(&q) = pts.last() {
        let (r_pp, d_pp) = if pts.len() >= 2 {
          let qq = pts[pts.len() - 2];
          (enc.passes[qq].rate as f64, enc.passes[qq].distortion)
        } else {
          (0.0, 0.0)
        };
        let prev_slope =
          (enc.passes[q].distortion - d_pp) / (enc.passes[q].rate as f64 - r_pp).max(1e-9);
        if prev_slope <= slope {
          pts.pop();
          continue;
        }
      }
      break;
    }
    pts.push(p);
  }
  pts
}

fn slope_at(blk: &CodeblockEnc, pts: &[usize], idx: usize) -> f64 {
  let enc = blk.enc.as_ref().expect("hull points imply coder output");
  let (r0, d0) = if idx == 0 {
    (0.0, 0.0)
  } else {
    let q = pts[idx - 1];
    (enc.passes[q].rate as f64, enc.passes[q].distortion)
  };
  let q = pts[idx];
  let dr = (enc.passes[q].rate as f64 - r0).max(1e-9);
  (enc.passes[q].distortion - d0) / dr
}

/// Bytes contributed by a block when truncated at slope `lambda`,
/// counting only passes beyond `from_pass`.
fn block_cut(blk: &CodeblockEnc, pts: &[usize], lambda: f64, from_pass: u32) -> (u32, u32) {
  let enc = match &blk.enc {
    Some(e) => e,
    None => return (from_pass, 0),
  };
  let mut end_pass = from_pass;
  for (i, &p) in pts.iter().enumerate() {
    if (p as u32) < from_pass {
      continue;
    }
    if slope_at(blk, pts, i) >= lambda {
      end_pass = p as u32 + 1;
    }
  }
  let hi = if end_pass == 0 {
    0
  } else {
    enc.passes[end_pass as usize - 1].rate
  };
  let lo = if from_pass == 0 {
    0
  } else {
    enc.passes[from_pass as usize - 1].rate
  };
  (end_pass, hi.saturating_sub(lo))
}

/// Assigns pass ranges to `num_layers` layers across all blocks of a
/// tile. `targets[l]`, when set, is the cumulative body-byte budget up
/// to and including layer `l`; the final layer with no target absorbs
/// every remaining pass.
pub(crate) fn allocate_layers(
  blocks: &mut [&mut CodeblockEnc],
  num_layers: u16,
  targets: &[Option<u64>],
) -> Result<()> {
  let hulls: Vec<Vec<usize>> = blocks.iter().map(|b| hull_points(b)).collect();

  // Global slope range for the bisection.
  let mut smin = f64::MAX;
  let mut smax = 0.0f64;
  for (b, pts) in blocks.iter().zip(hulls.iter()) {
    for i in 0..pts.len() {
      let s = slope_at(b, pts, i);
      if s > 0.0 {
        smin = smin.min(s);
        smax = smax.max(s);
      }
    }
  }
  if smax == 0.0 {
    smax = 1.0;
    smin = 0.0;
  }

  let mut emitted: Vec<u32> = blocks.iter().map(|_| 0u32).collect();
  let mut spent: u64 = 0;

  for layno in 0..num_layers {
    blocks.iter_mut().for_each(|b| {
      if b.layers.len() == layno as usize {
        b.layers.push(BlockLayer::default());
      }
    });

    let cut: Vec<(u32, u32)> = match targets.get(layno as usize).copied().flatten() {
      None => {
        // No budget: everything left goes into this layer.
        blocks
          .iter()
          .zip(emitted.iter())
          .map(|(b, &from)| {
            let total = b.enc.as_ref().map(|e| e.passes.len() as u32).unwrap_or(0);
            let hi = b
              .enc
              .as_ref()
              .and_then(|e| e.passes.last())
              .map(|p| p.rate)
              .unwrap_or(0);
            let lo = if from == 0 {
              0
            } else {
              b.enc.as_ref().unwrap().passes[from as usize - 1].rate
            };
            (total, hi.saturating_sub(lo))
          })
          .collect()
      }
      Some(budget) => {
        let layer_budget = budget.saturating_sub(spent);
        // Bisect the slope threshold; lower lambda admits more bytes.
        let mut lo = smin * 0.5;
        let mut hi = smax * 2.0;
        let mut best: Option<Vec<(u32, u32)>> = None;
        for _ in 0..64 {
          let lambda = (lo + hi) / 2.0;
          let trial: Vec<(u32, u32)> = blocks
            .iter()
            .zip(hulls.iter())
            .zip(emitted.iter())
            .map(|((b, pts), &from)| block_cut(b, pts, lambda, from))
            .collect();
          let bytes: u64 = trial.iter().map(|&(_, len)| len as u64).sum();
          if bytes <= layer_budget {
            best = Some(trial);
            hi = lambda;
          } else {
            lo = lambda;
          }
        }
        best.ok_or(Error::WouldExceedBudget {
          target_bytes: budget,
        })?
      }
    };

    for ((blk, &(end_pass, len)), from) in blocks.iter_mut().zip(cut.iter()).zip(emitted.iter_mut())
    {
      let num_passes = end_pass.saturating_sub(*from);
      let offset = if *from == 0 {
        0
      } else {
        blk.enc.as_ref().unwrap().passes[*from as usize - 1].rate
      };
      let disto = if num_passes > 0 {
        let e = blk.enc.as_ref().unwrap();
        let d_hi = e.passes[end_pass as usize - 1].distortion;
        let d_lo = if *from == 0 {
          0.0
        } else {
          e.passes[*from as usize - 1].distortion
        };
        d_hi - d_lo
      } else {
        0.0
      };
      blk.layers[layno as usize] = BlockLayer {
        num_passes,
        len,
        disto,
        offset,
      };
      if num_passes > 0 && blk.included_in_layer.is_none() {
        blk.included_in_layer = Some(layno);
      }
      *from = end_pass;
      spent += len as u64;
    }
  }

  // Every pass must land in some layer when the last layer is open.
  if targets.last().map(|t| t.is_none()).unwrap_or(true) {
    for (blk, &e) in blocks.iter().zip(emitted.iter()) {
      let total = blk.enc.as_ref().map(|x| x.passes.len() as u32).unwrap_or(0);
      debug_assert_eq!(e, total, "open final layer absorbs all passes");
    }
  } else if spent == 0
    && blocks
      .iter()
      .any(|b| b.enc.as_ref().map(|e| !e.passes.is_empty()).unwrap_or(false))
  {
    // A fully budgeted stream that admits not a single pass cannot be
    // represented with even one layer.
    let target_bytes = targets.last().copied().flatten().unwrap_or(0);
    return Err(Error::WouldExceedBudget { target_bytes });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::math::Rect;
  use crate::t1::{EncOut, EncPass};

  fn block(rates: &[u32], distos: &[f64]) -> CodeblockEnc {
    let passes: Vec<EncPass> = rates
      .iter()
      .zip(distos.iter())
      .map(|(&rate, &distortion)| EncPass {
        rate,
        distortion,
        term: false,
        len: 0,
      })
      .collect();
    CodeblockEnc {
      rect: Rect::new(0, 0, 16, 16),
      enc: Some(EncOut {
        data: vec![0; *rates.last().unwrap() as usize],
        numbps: 5,
        passes,
      }),
      ..Default::default()
    }
  }

  #[test]
  fn single_open_layer_takes_everything() {
    let mut b = block(&[10, 18, 30], &[100.0, 150.0, 170.0]);
    {
      let mut view = [&mut b];
      allocate_layers(&mut view[..], 1, &[None]).unwrap();
    }
    assert_eq!(b.layers.len(), 1);
    assert_eq!(b.layers[0].num_passes, 3);
    assert_eq!(b.layers[0].len, 30);
    assert_eq!(b.included_in_layer, Some(0));
  }

  #[test]
  fn budgeted_first_layer_respects_bytes() {
    let mut b1 = block(&[10, 18, 30], &[100.0, 140.0, 160.0]);
    let mut b2 = block(&[8, 20, 26], &[90.0, 120.0, 130.0]);
    {
      let mut view = [&mut b1, &mut b2];
      allocate_layers(&mut view[..], 2, &[Some(30), None]).unwrap();
    }
    let l0: u64 = b1.layers[0].len as u64 + b2.layers[0].len as u64;
    assert!(l0 <= 30, "layer 0 spent {}", l0);
    // Everything appears by the end.
    assert_eq!(
      b1.layers.iter().map(|l| l.num_passes).sum::<u32>(),
      3,
      "all passes assigned"
    );
    assert_eq!(b2.layers.iter().map(|l| l.num_passes).sum::<u32>(), 3);
    // Offsets chain correctly.
    assert_eq!(b1.layers[1].offset, b1.layers[0].len);
  }

  #[test]
  fn impossible_budget_is_reported() {
    let mut b = block(&[50, 90], &[10.0, 12.0]);
    let mut view = [&mut b];
    let err = allocate_layers(&mut view[..], 1, &[Some(5)]).unwrap_err();
    match err {
      Error::WouldExceedBudget { target_bytes } => assert_eq!(target_bytes, 5),
      other => panic!("unexpected error {:?}", other),
    }
  }
}
