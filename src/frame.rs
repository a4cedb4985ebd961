//! One detector readout and its pass-through metadata.

use crate::detector::DetectorLayout;
use crate::error::FrameError;

/// Per-frame scalars supplied by the acquisition side.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    /// Monotonically increasing sequence id assigned by acquisition.
    pub sequence_id: u64,
    pub run_number: u32,
    /// Timestamp, whole seconds since the epoch.
    pub seconds: i64,
    pub nanoseconds: u32,
    /// Accelerator fiducial of the shot.
    pub fiducial: u32,
    /// Photon energy in eV.
    pub photon_energy_ev: f64,
    /// Photon wavelength in Å. NaN when the beam energy is unknown.
    pub wavelength_a: f64,
    /// Sample-to-detector distance in mm.
    pub detector_position_mm: f64,
    /// Electron bunch charge in nC.
    pub ebeam_charge_nc: f64,
    /// Electron beam energy in MeV.
    pub ebeam_energy_mev: f64,
    /// Pulse energy from the gas detector, mJ.
    pub gmd_mj: f64,
    /// Total thickness of inserted attenuation filters, µm.
    pub filter_thickness_um: Option<u32>,
}

impl Default for FrameMetadata {
    fn default() -> Self {
        Self {
            sequence_id: 0,
            run_number: 0,
            seconds: 0,
            nanoseconds: 0,
            fiducial: 0,
            photon_energy_ev: f64::NAN,
            wavelength_a: f64::NAN,
            detector_position_mm: f64::NAN,
            ebeam_charge_nc: 0.0,
            ebeam_energy_mev: 0.0,
            gmd_mj: 0.0,
            filter_thickness_um: None,
        }
    }
}

impl FrameMetadata {
    /// Event name used in logs and by sinks: `r0042_1300000000_1a2b3`.
    pub fn event_name(&self) -> String {
        format!(
            "r{:04}_{}_{:05x}",
            self.run_number, self.seconds, self.fiducial
        )
    }

    /// Timestamp as fractional seconds.
    pub fn timestamp(&self) -> f64 {
        self.seconds as f64 + self.nanoseconds as f64 * 1e-9
    }
}

/// A raw detector frame, owned exclusively by the worker that processes it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub raw: Vec<u16>,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(raw: Vec<u16>, metadata: FrameMetadata) -> Self {
        Self { raw, metadata }
    }

    /// Check the raw buffer against the detector layout.
    pub fn validate(&self, layout: &DetectorLayout) -> Result<(), FrameError> {
        let id = self.metadata.sequence_id;
        if self.raw.is_empty() {
            return Err(FrameError::input(id, "empty pixel buffer"));
        }
        if self.raw.len() != layout.pixel_count() {
            return Err(FrameError::input(
                id,
                format!(
                    "pixel buffer has {} values, detector has {}",
                    self.raw.len(),
                    layout.pixel_count()
                ),
            ));
        }
        Ok(())
    }
}
