//! Enrollment and 1:N recognition on top of the store.
//!
//! The detector always runs before any store lock is taken, so slow
//! inference never blocks unrelated reads or writes.

use crate::detector::{DetectorError, FaceDetector};
use crate::error::{FacebankError, Result, ValidationError};
use crate::matcher::{CosineMatcher, Matcher, RankParams, SubjectMatch};
use crate::store::EmbeddingStore;
use crate::types::{round5, DetectedFace, FaceBox, FaceId, FaceImage, Gender, StoredEmbedding};
use serde::Serialize;
use std::sync::Arc;

const AGE_SPREAD: u32 = 5;

/// Engine-wide thresholds.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Minimum cosine similarity for a stored face to count as a match.
    pub similarity_threshold: f32,
    /// Default minimum detector confidence to accept a face.
    pub detection_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            detection_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollOptions {
    /// Overrides [`EngineConfig::detection_threshold`] for this call.
    pub det_prob_threshold: Option<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecognizeOptions {
    /// Maximum number of faces returned; 0 = all.
    pub limit: usize,
    /// Overrides [`EngineConfig::detection_threshold`] for this call.
    pub det_prob_threshold: Option<f32>,
    /// Maximum matches per face; 0 = every match above threshold.
    pub prediction_count: usize,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            det_prob_threshold: None,
            prediction_count: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrolled {
    pub image_id: FaceId,
    pub subject: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgeRange {
    pub low: u32,
    pub high: u32,
}

/// Recognition result for one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizedFace {
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    /// Detector confidence, rounded to 5 decimal digits.
    pub probability: f32,
    pub subjects: Vec<SubjectMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<AgeRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

/// Enrollment stage whose check rejected a request, for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnrollStage {
    Decoded,
    Detected,
    Validated,
    Stored,
}

/// Recognition engine: detector + store + matcher.
pub struct RecognitionEngine<D> {
    store: Arc<EmbeddingStore>,
    detector: D,
    config: EngineConfig,
}

impl<D: FaceDetector> RecognitionEngine<D> {
    pub fn new(store: Arc<EmbeddingStore>, detector: D, config: EngineConfig) -> Self {
        tracing::info!(
            similarity_threshold = config.similarity_threshold,
            detection_threshold = config.detection_threshold,
            "recognition engine ready"
        );
        Self {
            store,
            detector,
            config,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the single face in `image` under `subject`.
    pub fn enroll(&self, subject: &str, image: &[u8], opts: EnrollOptions) -> Result<Enrolled> {
        let threshold = opts
            .det_prob_threshold
            .unwrap_or(self.config.detection_threshold);

        let faces = self.detect(image).map_err(|e| {
            // Detector failures are internal and already logged by `detect`.
            if let FacebankError::Validation(reason) = &e {
                tracing::info!(subject, stage = ?EnrollStage::Decoded, error = %reason, "enrollment rejected");
            }
            e
        })?;
        let face = select_enrollment_face(faces, threshold).map_err(|e| {
            let stage = match e {
                ValidationError::BelowDetectionThreshold { .. } => EnrollStage::Validated,
                _ => EnrollStage::Detected,
            };
            tracing::info!(subject, ?stage, error = %e, "enrollment rejected");
            e
        })?;

        let image_id = self.store.add_face(subject, face.embedding, image)?;
        tracing::debug!(subject, face_id = %image_id, stage = ?EnrollStage::Stored, "enrollment complete");
        Ok(Enrolled {
            image_id,
            subject: subject.to_string(),
        })
    }

    /// Identify every sufficiently confident face in `image`.
    pub fn recognize(&self, image: &[u8], opts: RecognizeOptions) -> Result<Vec<RecognizedFace>> {
        let faces = self.detect(image)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        let gallery = self.store.get_all_embeddings()?;
        self.rank_faces(faces, &gallery, opts)
    }

    /// Image bytes of an enrolled face.
    pub fn face_image(&self, id: FaceId) -> Result<FaceImage> {
        self.store.face_image(id)
    }

    /// Decode check plus detector call. Holds no store lock.
    fn detect(&self, bytes: &[u8]) -> Result<Vec<DetectedFace>> {
        if image::guess_format(bytes).is_err() {
            return Err(ValidationError::InvalidImage.into());
        }
        match self.detector.detect(bytes) {
            Ok(faces) => Ok(faces),
            Err(DetectorError::Undecodable(reason)) => {
                tracing::debug!(%reason, "detector could not decode image");
                Err(ValidationError::InvalidImage.into())
            }
            Err(e) => {
                tracing::error!(error = %e, "face detector failed");
                Err(FacebankError::Detector(e))
            }
        }
    }

    fn rank_faces(
        &self,
        faces: Vec<DetectedFace>,
        gallery: &[StoredEmbedding],
        opts: RecognizeOptions,
    ) -> Result<Vec<RecognizedFace>> {
        let det_threshold = opts
            .det_prob_threshold
            .unwrap_or(self.config.detection_threshold);
        let params = RankParams {
            similarity_threshold: self.config.similarity_threshold,
            prediction_count: opts.prediction_count,
        };
        let expected_dim = gallery.first().map(|g| g.embedding.dimension());

        let mut results = Vec::new();
        for face in faces {
            let score = face.detection_score();
            if score < det_threshold {
                tracing::debug!(score, threshold = det_threshold, "face below detection threshold; skipped");
                continue;
            }
            face.embedding.validate()?;
            if let Some(expected) = expected_dim {
                let got = face.embedding.dimension();
                if got != expected {
                    return Err(ValidationError::DimensionMismatch { expected, got }.into());
                }
            }

            let ranking = CosineMatcher.rank(&face.embedding, gallery, params);
            if let Some((subject, similarity)) = &ranking.best {
                let accepted = *similarity >= params.similarity_threshold;
                tracing::debug!(
                    subject = %subject,
                    similarity,
                    threshold = params.similarity_threshold,
                    accepted,
                    "best candidate"
                );
            }

            results.push(RecognizedFace {
                bbox: FaceBox::from(&face.bbox),
                probability: round5(score),
                subjects: ranking.matches,
                age: face.age.map(|age| AgeRange {
                    low: age.saturating_sub(AGE_SPREAD),
                    high: age.saturating_add(AGE_SPREAD),
                }),
                gender: face.gender,
            });
        }

        if opts.limit > 0 {
            results.truncate(opts.limit);
        }
        Ok(results)
    }
}

/// Enrollment needs exactly one face, confident enough.
fn select_enrollment_face(
    mut faces: Vec<DetectedFace>,
    threshold: f32,
) -> std::result::Result<DetectedFace, ValidationError> {
    let face = match faces.len() {
        0 => return Err(ValidationError::NoFaceFound),
        1 => faces.remove(0),
        n => return Err(ValidationError::MultipleFacesFound(n)),
    };
    let score = face.detection_score();
    if score < threshold {
        return Err(ValidationError::BelowDetectionThreshold { score, threshold });
    }
    Ok(face)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{BoundingBox, Embedding};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    /// Detector that returns whatever faces the test scripted.
    #[derive(Default)]
    struct ScriptedDetector {
        faces: Mutex<Vec<DetectedFace>>,
        fail: bool,
    }

    impl ScriptedDetector {
        fn set(&self, faces: Vec<DetectedFace>) {
            *self.faces.lock().unwrap() = faces;
        }
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&self, _image: &[u8]) -> std::result::Result<Vec<DetectedFace>, DetectorError> {
            if self.fail {
                return Err(DetectorError::InferenceFailed("gpu on fire".into()));
            }
            Ok(self.faces.lock().unwrap().clone())
        }
    }

    fn face(values: &[f32], score: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 10.0,
                y: 20.0,
                width: 100.0,
                height: 120.0,
                confidence: score,
            },
            embedding: Embedding::new(values.to_vec()),
            age: None,
            gender: None,
        }
    }

    fn engine() -> (TempDir, RecognitionEngine<ScriptedDetector>) {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        let engine = RecognitionEngine::new(
            Arc::new(store),
            ScriptedDetector::default(),
            EngineConfig::default(),
        );
        (tmp, engine)
    }

    fn image_count(tmp: &TempDir) -> usize {
        std::fs::read_dir(tmp.path().join("images")).unwrap().count()
    }

    #[test]
    fn test_enroll_then_recognize_exact() {
        let (_tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.99)]);
        let enrolled = engine.enroll("A", PNG, EnrollOptions::default()).unwrap();
        assert_eq!(enrolled.subject, "A");
        assert_eq!(engine.store().list_subjects().unwrap(), ["A"]);
        assert_eq!(engine.store().list_faces(Some("A")).unwrap().len(), 1);

        let results = engine.recognize(PNG, RecognizeOptions::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].subjects.len(), 1);
        assert_eq!(results[0].subjects[0].subject, "A");
        assert_eq!(results[0].subjects[0].similarity, 1.0);
        assert_eq!(results[0].probability, 0.99);
    }

    #[test]
    fn test_recognize_excludes_below_similarity_threshold() {
        let (_tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.9)]);
        engine.enroll("A", PNG, EnrollOptions::default()).unwrap();
        engine.detector.set(vec![face(&[0.0, 1.0], 0.9)]);
        engine.enroll("B", PNG, EnrollOptions::default()).unwrap();

        let norm = (0.9f32 * 0.9 + 0.1 * 0.1).sqrt();
        engine.detector.set(vec![face(&[0.9 / norm, 0.1 / norm], 0.9)]);
        let opts = RecognizeOptions {
            prediction_count: 0,
            ..Default::default()
        };
        let results = engine.recognize(PNG, opts).unwrap();
        let names: Vec<_> = results[0].subjects.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(names, ["A"]);
    }

    #[test]
    fn test_enroll_multiple_faces_rejected_without_side_effects() {
        let (tmp, engine) = engine();
        engine
            .detector
            .set(vec![face(&[1.0, 0.0], 0.9), face(&[0.0, 1.0], 0.9)]);
        let err = engine.enroll("A", PNG, EnrollOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            FacebankError::Validation(ValidationError::MultipleFacesFound(2))
        ));
        assert!(engine.store().list_subjects().unwrap().is_empty());
        assert_eq!(image_count(&tmp), 0);
    }

    #[test]
    fn test_enroll_no_face() {
        let (_tmp, engine) = engine();
        let err = engine.enroll("A", PNG, EnrollOptions::default()).unwrap_err();
        assert!(matches!(err, FacebankError::Validation(ValidationError::NoFaceFound)));
    }

    #[test]
    fn test_enroll_below_detection_threshold() {
        let (_tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.3)]);
        let err = engine.enroll("A", PNG, EnrollOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            FacebankError::Validation(ValidationError::BelowDetectionThreshold { .. })
        ));

        // A per-call threshold can admit it.
        let opts = EnrollOptions {
            det_prob_threshold: Some(0.2),
        };
        engine.enroll("A", PNG, opts).unwrap();
    }

    #[test]
    fn test_undecodable_image_rejected() {
        let (_tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.9)]);
        let err = engine
            .enroll("A", b"definitely not an image", EnrollOptions::default())
            .unwrap_err();
        assert!(matches!(err, FacebankError::Validation(ValidationError::InvalidImage)));
        let err = engine.recognize(b"", RecognizeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_detector_failure_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        let detector = ScriptedDetector {
            fail: true,
            ..Default::default()
        };
        let engine = RecognitionEngine::new(Arc::new(store), detector, EngineConfig::default());
        let err = engine.recognize(PNG, RecognizeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_recognize_filters_low_confidence_faces_and_limits() {
        let (_tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.9)]);
        engine.enroll("A", PNG, EnrollOptions::default()).unwrap();

        engine.detector.set(vec![
            face(&[1.0, 0.0], 0.95),
            face(&[1.0, 0.0], 0.2),
            face(&[0.0, 1.0], 0.8),
        ]);
        let results = engine.recognize(PNG, RecognizeOptions::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].subjects[0].subject, "A");
        assert!(results[1].subjects.is_empty());

        let limited = RecognizeOptions {
            limit: 1,
            ..Default::default()
        };
        assert_eq!(engine.recognize(PNG, limited).unwrap().len(), 1);
    }

    #[test]
    fn test_prediction_count_bounds_matches() {
        let (_tmp, engine) = engine();
        for (name, values) in [("a", [1.0f32, 0.1]), ("b", [1.0, 0.2]), ("c", [1.0, 0.3])] {
            engine.detector.set(vec![face(&values, 0.9)]);
            engine.enroll(name, PNG, EnrollOptions::default()).unwrap();
        }
        engine.detector.set(vec![face(&[1.0, 0.0], 0.9)]);

        let one = engine.recognize(PNG, RecognizeOptions::default()).unwrap();
        assert_eq!(one[0].subjects.len(), 1);
        assert_eq!(one[0].subjects[0].subject, "a");

        let all = RecognizeOptions {
            prediction_count: 0,
            ..Default::default()
        };
        let all = engine.recognize(PNG, all).unwrap();
        let sims: Vec<_> = all[0].subjects.iter().map(|m| m.similarity).collect();
        assert_eq!(sims.len(), 3);
        assert!(sims.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_recognize_empty_store_returns_unmatched_face() {
        let (_tmp, engine) = engine();
        let mut f = face(&[1.0, 0.0], 0.9);
        f.age = Some(3);
        f.gender = Some(Gender::Female);
        engine.detector.set(vec![f]);

        let results = engine.recognize(PNG, RecognizeOptions::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].subjects.is_empty());
        assert_eq!(results[0].age, Some(AgeRange { low: 0, high: 8 }));
        assert_eq!(results[0].gender, Some(Gender::Female));
        assert_eq!(
            results[0].bbox,
            FaceBox {
                x_min: 10,
                y_min: 20,
                x_max: 110,
                y_max: 140
            }
        );
    }

    #[test]
    fn test_recognize_dimension_mismatch() {
        let (_tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.9)]);
        engine.enroll("A", PNG, EnrollOptions::default()).unwrap();
        engine.detector.set(vec![face(&[1.0, 0.0, 0.0], 0.9)]);
        let err = engine.recognize(PNG, RecognizeOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            FacebankError::Validation(ValidationError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_age_range_saturates() {
        let (_tmp, engine) = engine();
        let mut f = face(&[1.0, 0.0], 0.9);
        f.age = Some(u32::MAX - 1);
        engine.detector.set(vec![f]);

        let results = engine.recognize(PNG, RecognizeOptions::default()).unwrap();
        assert_eq!(
            results[0].age,
            Some(AgeRange {
                low: u32::MAX - 6,
                high: u32::MAX
            })
        );
    }

    #[test]
    fn test_non_finite_embeddings_rejected() {
        let (tmp, engine) = engine();
        engine.detector.set(vec![face(&[1.0, 0.0], 0.9)]);
        engine.enroll("A", PNG, EnrollOptions::default()).unwrap();

        engine.detector.set(vec![face(&[f32::INFINITY, 0.0], 0.9)]);
        let err = engine.enroll("B", PNG, EnrollOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            FacebankError::Validation(ValidationError::NonFiniteEmbedding { index: 0 })
        ));
        assert_eq!(image_count(&tmp), 1);

        engine.detector.set(vec![face(&[0.0, f32::NAN], 0.9)]);
        let err = engine.recognize(PNG, RecognizeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(engine.store().list_subjects().unwrap(), ["A"]);
    }

    #[test]
    fn test_enroll_detector_failure_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = EmbeddingStore::open(tmp.path()).unwrap();
        let detector = ScriptedDetector {
            fail: true,
            ..Default::default()
        };
        let engine = RecognitionEngine::new(Arc::new(store), detector, EngineConfig::default());
        let err = engine.enroll("A", PNG, EnrollOptions::default()).unwrap_err();
        assert!(matches!(err, FacebankError::Detector(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_recognized_face_json_shape() {
        let r = RecognizedFace {
            bbox: FaceBox {
                x_min: 1,
                y_min: 2,
                x_max: 3,
                y_max: 4,
            },
            probability: 0.5,
            subjects: vec![],
            age: None,
            gender: Some(Gender::Male),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["box"]["x_max"], 3);
        assert_eq!(json["gender"], "male");
        assert!(json.get("age").is_none());
    }
}
