//! Group-capture recognition: many probes against one cohort gallery.

use crate::error::{AttendanceError, Result, Stage};
use crate::extractor::{ExtractError, Extractor};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::store::IdentityStore;
use crate::types::{Descriptor, IdentityId, Probe, Template};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How one probe of a capture was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub index: usize,
    pub identity: Option<IdentityId>,
    pub distance: Option<f32>,
    pub ambiguous: bool,
}

/// Outcome of recognizing one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub present: BTreeSet<IdentityId>,
    /// Raw number of probes, matched or not.
    pub detected_count: usize,
    pub unmatched: usize,
    /// Probes whose best distance was shared by another identity.
    pub ambiguous: usize,
    /// Matched probes whose identity was already present from an earlier probe.
    pub duplicate_hits: usize,
    pub probes: Vec<ProbeOutcome>,
}

/// Runs a [`Matcher`] over every probe of a capture.
#[derive(Debug, Clone)]
pub struct BatchRecognizer<M = EuclideanMatcher> {
    matcher: M,
    threshold: f32,
}

impl Default for BatchRecognizer<EuclideanMatcher> {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl BatchRecognizer<EuclideanMatcher> {
    pub fn new(threshold: f32) -> Self {
        Self {
            matcher: EuclideanMatcher,
            threshold,
        }
    }
}

impl<M: Matcher> BatchRecognizer<M> {
    pub fn with_matcher(matcher: M, threshold: f32) -> Self {
        Self { matcher, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Resolve every probe against `gallery`.
    ///
    /// Pure: reads only its arguments. Several probes may resolve to the same
    /// identity; `present` holds it once.
    pub fn recognize(
        &self,
        cohort: &str,
        gallery: &[Template],
        probes: &[Descriptor],
    ) -> Result<RecognitionResult> {
        if gallery.is_empty() {
            return Err(AttendanceError::NoEnrolledTemplates {
                cohort: cohort.to_string(),
            });
        }

        let mut present = BTreeSet::new();
        let mut outcomes = Vec::with_capacity(probes.len());
        let mut unmatched = 0;
        let mut ambiguous = 0;
        let mut duplicate_hits = 0;

        let probes = probes.iter().enumerate().map(|(index, descriptor)| Probe {
            index,
            descriptor: descriptor.clone(),
        });

        for probe in probes {
            let result = self.matcher.compare(&probe.descriptor, gallery, self.threshold);

            if result.ambiguous {
                ambiguous += 1;
                tracing::warn!(
                    cohort,
                    probe = probe.index,
                    distance = ?result.distance,
                    chosen = ?result.identity,
                    "ambiguous match: several identities tie at the minimum distance"
                );
            }

            match &result.identity {
                Some(identity) => {
                    if !present.insert(identity.clone()) {
                        duplicate_hits += 1;
                        tracing::warn!(
                            cohort,
                            probe = probe.index,
                            identity = %identity,
                            "identity matched by more than one probe in the same capture"
                        );
                    }
                }
                None if result.distance.is_none() => {
                    unmatched += 1;
                    tracing::warn!(
                        cohort,
                        probe = probe.index,
                        len = probe.descriptor.len(),
                        "probe has no comparable template; check descriptor length"
                    );
                }
                None => {
                    unmatched += 1;
                    tracing::debug!(
                        cohort,
                        probe = probe.index,
                        distance = ?result.distance,
                        "probe unmatched"
                    );
                }
            }

            outcomes.push(ProbeOutcome {
                index: probe.index,
                identity: result.identity,
                distance: result.distance,
                ambiguous: result.ambiguous,
            });
        }

        tracing::info!(
            cohort,
            detected = outcomes.len(),
            present = present.len(),
            unmatched,
            "recognition complete"
        );

        Ok(RecognitionResult {
            present,
            detected_count: outcomes.len(),
            unmatched,
            ambiguous,
            duplicate_hits,
            probes: outcomes,
        })
    }

    /// Snapshot the cohort's gallery from `store`, then recognize.
    pub fn recognize_cohort<S: IdentityStore + ?Sized>(
        &self,
        store: &S,
        cohort: &str,
        probes: &[Descriptor],
    ) -> Result<RecognitionResult> {
        let gallery = store
            .gallery(cohort)
            .map_err(AttendanceError::storage(Stage::Recognition))?;
        self.recognize(cohort, &gallery, probes)
    }

    /// Extract probes from a group capture and recognize them.
    ///
    /// An image with no detectable face counts as zero probes; any other
    /// extractor failure aborts the operation.
    pub fn recognize_capture<S, E>(
        &self,
        store: &S,
        extractor: &mut E,
        cohort: &str,
        image: &[u8],
    ) -> Result<RecognitionResult>
    where
        S: IdentityStore + ?Sized,
        E: Extractor + ?Sized,
    {
        let gallery = store
            .gallery(cohort)
            .map_err(AttendanceError::storage(Stage::Recognition))?;
        if gallery.is_empty() {
            return Err(AttendanceError::NoEnrolledTemplates {
                cohort: cohort.to_string(),
            });
        }

        let probes = match extractor.extract(image) {
            Ok(probes) => probes,
            Err(ExtractError::NoFaceDetected) => {
                tracing::info!(cohort, "no face detected in capture");
                Vec::new()
            }
            Err(ExtractError::Failed(reason)) => {
                return Err(AttendanceError::ExtractionFailed {
                    stage: Stage::Extraction,
                    reason,
                })
            }
        };

        self.recognize(cohort, &gallery, &probes)
    }
}
