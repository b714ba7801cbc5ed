//! ONNX face pipeline: detection, 68-point landmarks, 128-d embeddings.
//!
//! Three small models run via ONNX Runtime on grayscale frames: a coarse
//! face detector, a landmark regressor feeding the liveness gate, and a
//! recognition net producing the raw 128-d embedding the matcher consumes.
//! Everything above this module goes through the [`Extractor`] trait and
//! treats the models as a black box.

use crate::liveness::{LivenessFrame, Point};
use crate::types::{Detection, Embedding, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

// Detector operates on a fixed 320x240 input; landmark and recognition nets
// on 112x112 face crops.
const DET_INPUT_W: usize = 320;
const DET_INPUT_H: usize = 240;
const DET_MEAN: f32 = 127.0;
const DET_STD: f32 = 128.0;
const DET_SCORE_THRESHOLD: f32 = 0.5;

const CROP_INPUT_SIZE: usize = 112;
const CROP_MEAN: f32 = 127.5;
const CROP_STD: f32 = 127.5;

const LANDMARK_POINTS: usize = 68;

// iBUG 68-point indices for the contours the liveness gate consumes.
const LEFT_EYE: Range<usize> = 36..42;
const RIGHT_EYE: Range<usize> = 42..48;
const NOSE: Range<usize> = 27..36;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0} — fetch the model pack and set PRESENCA_MODEL_DIR")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding-extraction seam.
///
/// `NotDetected` is a normal outcome, not an error; errors are reserved for
/// the model runtime itself.
pub trait Extractor {
    /// Extract a face embedding from a grayscale frame.
    fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Detection<Embedding>, ExtractError>;

    /// Landmark geometry for the liveness gate, in frame pixel coordinates.
    fn landmarks(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Detection<LivenessFrame>, ExtractError>;
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy)]
struct FaceBox {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
}

/// ONNX-backed extractor.
pub struct OnnxExtractor {
    detector: Session,
    landmarker: Session,
    recognizer: Session,
}

impl OnnxExtractor {
    /// Load all three models. Fails fast if any file is missing so the
    /// daemon can degrade to manual-only mode at startup.
    pub fn load(
        detector_path: &str,
        landmark_path: &str,
        recognition_path: &str,
    ) -> Result<Self, ExtractError> {
        Ok(Self {
            detector: load_session(detector_path)?,
            landmarker: load_session(landmark_path)?,
            recognizer: load_session(recognition_path)?,
        })
    }

    /// Run the detector and return the highest-scoring face box, if any
    /// clears the score threshold.
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Detection<FaceBox>, ExtractError> {
        let resized = resize_gray(
            frame,
            width as usize,
            height as usize,
            DET_INPUT_W,
            DET_INPUT_H,
        );
        let input = preprocess_plane(&resized, DET_INPUT_W, DET_INPUT_H, DET_MEAN, DET_STD);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Output 0: [1, N, 2] softmax scores (background, face).
        // Output 1: [1, N, 4] box corners, normalized to the input.
        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("detector scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("detector boxes: {e}")))?;

        let candidates = scores.len() / 2;
        let mut best_idx = None;
        let mut best_score = DET_SCORE_THRESHOLD;
        for i in 0..candidates {
            let score = scores[i * 2 + 1];
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }
        let Some(idx) = best_idx else {
            return Ok(Detection::NotDetected);
        };
        if boxes.len() < (idx + 1) * 4 {
            return Err(ExtractError::InferenceFailed(format!(
                "detector box tensor too short: {} entries for candidate {idx}",
                boxes.len()
            )));
        }

        let (w, h) = (width as f32, height as f32);
        let raw = &boxes[idx * 4..idx * 4 + 4];
        let face = FaceBox {
            x0: (raw[0] * w).clamp(0.0, w),
            y0: (raw[1] * h).clamp(0.0, h),
            x1: (raw[2] * w).clamp(0.0, w),
            y1: (raw[3] * h).clamp(0.0, h),
        };
        if face.x1 <= face.x0 || face.y1 <= face.y0 {
            return Ok(Detection::NotDetected);
        }
        Ok(Detection::Detected(face))
    }

    /// Run the landmark regressor on a face crop, mapping the normalized
    /// coordinates back into frame pixels.
    fn landmarks_68(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Vec<Point>, ExtractError> {
        let crop = crop_resize_gray(frame, width as usize, height as usize, face, CROP_INPUT_SIZE);
        let input = preprocess_plane(&crop, CROP_INPUT_SIZE, CROP_INPUT_SIZE, CROP_MEAN, CROP_STD);

        let outputs = self
            .landmarker
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, coords) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("landmark regression: {e}")))?;

        if coords.len() < LANDMARK_POINTS * 2 {
            return Err(ExtractError::InferenceFailed(format!(
                "expected {} landmark coordinates, got {}",
                LANDMARK_POINTS * 2,
                coords.len()
            )));
        }

        let (bw, bh) = (face.x1 - face.x0, face.y1 - face.y0);
        Ok((0..LANDMARK_POINTS)
            .map(|i| Point::new(face.x0 + coords[i * 2] * bw, face.y0 + coords[i * 2 + 1] * bh))
            .collect())
    }

    /// Run the recognition net on a face crop.
    fn embed(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Embedding, ExtractError> {
        let crop = crop_resize_gray(frame, width as usize, height as usize, face, CROP_INPUT_SIZE);
        let input = preprocess_plane(&crop, CROP_INPUT_SIZE, CROP_INPUT_SIZE, CROP_MEAN, CROP_STD);

        let outputs = self
            .recognizer
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ExtractError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // Raw output, deliberately not normalized — the match threshold is
        // calibrated on un-normalized Euclidean distance.
        Ok(Embedding::new(raw.to_vec()))
    }
}

impl Extractor for OnnxExtractor {
    fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Detection<Embedding>, ExtractError> {
        match self.detect(frame, width, height)? {
            Detection::Detected(face) => Ok(Detection::Detected(
                self.embed(frame, width, height, &face)?,
            )),
            Detection::NotDetected => Ok(Detection::NotDetected),
        }
    }

    fn landmarks(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Detection<LivenessFrame>, ExtractError> {
        let face = match self.detect(frame, width, height)? {
            Detection::Detected(face) => face,
            Detection::NotDetected => return Ok(Detection::NotDetected),
        };
        let points = self.landmarks_68(frame, width, height, &face)?;

        let eye_points = points[LEFT_EYE]
            .iter()
            .chain(points[RIGHT_EYE].iter())
            .copied()
            .collect();
        let nose_points = points[NOSE].to_vec();
        Ok(Detection::Detected(LivenessFrame {
            eye_points,
            nose_points,
        }))
    }
}

fn load_session(path: &str) -> Result<Session, ExtractError> {
    if !Path::new(path).exists() {
        return Err(ExtractError::ModelNotFound(path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        path,
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded model"
    );

    Ok(session)
}

/// Nearest-neighbor resize of a grayscale plane.
fn resize_gray(src: &[u8], sw: usize, sh: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut out = vec![0u8; dw * dh];
    if sw == 0 || sh == 0 {
        return out;
    }
    for y in 0..dh {
        let sy = (y * sh / dh).min(sh - 1);
        for x in 0..dw {
            let sx = (x * sw / dw).min(sw - 1);
            out[y * dw + x] = src.get(sy * sw + sx).copied().unwrap_or(0);
        }
    }
    out
}

/// Crop `face` out of a grayscale frame and resize to `size`×`size`,
/// clamping the crop rectangle to the frame.
fn crop_resize_gray(src: &[u8], sw: usize, sh: usize, face: &FaceBox, size: usize) -> Vec<u8> {
    if sw == 0 || sh == 0 {
        return vec![0u8; size * size];
    }
    let x0 = (face.x0.max(0.0) as usize).min(sw - 1);
    let y0 = (face.y0.max(0.0) as usize).min(sh - 1);
    let x1 = (face.x1.max(0.0) as usize).clamp(x0 + 1, sw);
    let y1 = (face.y1.max(0.0) as usize).clamp(y0 + 1, sh);
    let (cw, ch) = (x1 - x0, y1 - y0);

    let mut out = vec![0u8; size * size];
    for y in 0..size {
        let sy = y0 + (y * ch / size).min(ch - 1);
        for x in 0..size {
            let sx = x0 + (x * cw / size).min(cw - 1);
            out[y * size + x] = src.get(sy * sw + sx).copied().unwrap_or(0);
        }
    }
    out
}

/// Normalize a grayscale plane into a NCHW float tensor, replicating the
/// single luma channel across RGB.
fn preprocess_plane(plane: &[u8], width: usize, height: usize, mean: f32, std: f32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, height, width));
    for y in 0..height {
        for x in 0..width {
            let pixel = plane.get(y * width + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - mean) / std;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_identity() {
        let src: Vec<u8> = (0..16).collect();
        assert_eq!(resize_gray(&src, 4, 4, 4, 4), src);
    }

    #[test]
    fn test_resize_downsample_picks_grid_corners() {
        // 4x4 → 2x2 nearest-neighbor takes rows 0/2, cols 0/2.
        let src: Vec<u8> = (0..16).collect();
        assert_eq!(resize_gray(&src, 4, 4, 2, 2), vec![0, 2, 8, 10]);
    }

    #[test]
    fn test_crop_resize_extracts_region() {
        // 4x4 frame, crop the bottom-right 2x2 quadrant at native size.
        let src: Vec<u8> = (0..16).collect();
        let face = FaceBox {
            x0: 2.0,
            y0: 2.0,
            x1: 4.0,
            y1: 4.0,
        };
        assert_eq!(crop_resize_gray(&src, 4, 4, &face, 2), vec![10, 11, 14, 15]);
    }

    #[test]
    fn test_crop_resize_clamps_to_frame() {
        let src: Vec<u8> = vec![7; 16];
        let face = FaceBox {
            x0: -5.0,
            y0: -5.0,
            x1: 50.0,
            y1: 50.0,
        };
        let out = crop_resize_gray(&src, 4, 4, &face, 2);
        assert_eq!(out, vec![7, 7, 7, 7]);
    }

    #[test]
    fn test_preprocess_output_shape() {
        let plane = vec![128u8; CROP_INPUT_SIZE * CROP_INPUT_SIZE];
        let tensor = preprocess_plane(&plane, CROP_INPUT_SIZE, CROP_INPUT_SIZE, CROP_MEAN, CROP_STD);
        assert_eq!(tensor.shape(), &[1, 3, CROP_INPUT_SIZE, CROP_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let plane = vec![128u8; 4];
        let tensor = preprocess_plane(&plane, 2, 2, CROP_MEAN, CROP_STD);
        let expected = (128.0 - CROP_MEAN) / CROP_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let plane: Vec<u8> = (0..4).map(|v| v * 60).collect();
        let tensor = preprocess_plane(&plane, 2, 2, DET_MEAN, DET_STD);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_contour_index_ranges() {
        assert_eq!(LEFT_EYE.len(), 6);
        assert_eq!(RIGHT_EYE.len(), 6);
        assert_eq!(NOSE.len(), 9);
        assert!(NOSE.end <= LANDMARK_POINTS);
        assert!(RIGHT_EYE.end <= LANDMARK_POINTS);
    }
}
