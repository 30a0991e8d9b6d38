//! Connector, mode and encoder/CRTC selection.
//!
//! Resolution runs on a [`ResourceSnapshot`] read from the device once at startup, so
//! the policy itself is pure and does not touch the kernel.

use smithay::reexports::drm::control::{
    Device as ControlDevice, Mode, ModeTypeFlags, ResourceHandles, connector,
};

use crate::{DisplayError, Result, config::ModeRequest};

/// A display mode as offered by a connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputMode {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub refresh: u32,
    pub preferred: bool,
    /// The kernel's mode as read with the snapshot; `None` for modes built by hand.
    pub kernel: Option<Mode>,
}

impl OutputMode {
    pub fn area(&self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }
}

impl From<&Mode> for OutputMode {
    fn from(mode: &Mode) -> Self {
        let (width, height) = mode.size();
        Self {
            name: mode.name().to_string_lossy().into_owned(),
            width,
            height,
            refresh: mode.vrefresh(),
            preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
            kernel: Some(*mode),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorSnapshot {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub current_encoder: Option<u32>,
    pub encoders: Vec<u32>,
    pub modes: Vec<OutputMode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderSnapshot {
    pub id: u32,
    /// CRTC the encoder is currently bound to.
    pub crtc: Option<u32>,
    /// Bit `i` set means the CRTC at index `i` of the resource CRTC list is usable.
    pub possible_crtcs: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub connectors: Vec<ConnectorSnapshot>,
    pub encoders: Vec<EncoderSnapshot>,
    /// CRTC kernel ids in resource array order.
    pub crtcs: Vec<u32>,
}

impl ResourceSnapshot {
    /// Read connectors, encoders and CRTCs from `device`.
    ///
    /// Objects that vanish between listing and querying are skipped.
    pub fn read<D: ControlDevice>(device: &D, resources: &ResourceHandles) -> Self {
        let crtc_handles = resources.crtcs();

        let encoders = resources
            .encoders()
            .iter()
            .filter_map(|handle| match device.get_encoder(*handle) {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(encoder = ?handle, "failed to query encoder: {err}");
                    None
                }
            })
            .map(|info| {
                let usable = resources.filter_crtcs(info.possible_crtcs());
                let possible_crtcs = crtc_handles
                    .iter()
                    .enumerate()
                    .filter(|(_, crtc)| usable.contains(crtc))
                    .fold(0u32, |mask, (index, _)| mask | (1 << index));
                EncoderSnapshot {
                    id: info.handle().into(),
                    crtc: info.crtc().map(u32::from),
                    possible_crtcs,
                }
            })
            .collect();

        let connectors = resources
            .connectors()
            .iter()
            .filter_map(|handle| match device.get_connector(*handle, true) {
                Ok(info) => Some(info),
                Err(err) => {
                    tracing::warn!(connector = ?handle, "failed to query connector: {err}");
                    None
                }
            })
            .map(|info| ConnectorSnapshot {
                id: info.handle().into(),
                name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
                connected: info.state() == connector::State::Connected,
                current_encoder: info.current_encoder().map(u32::from),
                encoders: info.encoders().iter().copied().map(u32::from).collect(),
                modes: info.modes().iter().map(OutputMode::from).collect(),
            })
            .collect();

        Self {
            connectors,
            encoders,
            crtcs: crtc_handles.iter().copied().map(u32::from).collect(),
        }
    }

    fn encoder(&self, id: u32) -> Option<&EncoderSnapshot> {
        self.encoders.iter().find(|encoder| encoder.id == id)
    }
}

/// Where the chosen connector is scanned out from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrtcBinding {
    pub connector_id: u32,
    pub encoder_id: u32,
    /// Kernel object id, used in mode-set and flip calls.
    pub crtc_id: u32,
    /// Position in the resource CRTC list, used for possible-CRTC bitmask tests.
    pub crtc_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeSelection {
    pub index: usize,
    /// A named mode was requested but not offered.
    pub fallback: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputSelection {
    pub connector_index: usize,
    pub mode: OutputMode,
    pub mode_index: usize,
    pub mode_fallback: bool,
    pub binding: CrtcBinding,
}

/// Pick the connector, mode and CRTC to drive.
pub fn resolve_output(
    snapshot: &ResourceSnapshot,
    request: Option<&ModeRequest>,
) -> Result<OutputSelection> {
    let connector_index = snapshot
        .connectors
        .iter()
        .position(|connector| connector.connected)
        .ok_or(DisplayError::NoConnectedOutput)?;
    let connector = &snapshot.connectors[connector_index];

    let selection = select_mode(&connector.modes, request).ok_or(DisplayError::NoModeAvailable)?;
    let binding = resolve_crtc(snapshot, connector)?;
    let mode = connector.modes[selection.index].clone();

    tracing::info!(
        connector = %connector.name,
        connector_id = binding.connector_id,
        encoder_id = binding.encoder_id,
        crtc_id = binding.crtc_id,
        crtc_index = binding.crtc_index,
        mode = %mode.name,
        width = mode.width,
        height = mode.height,
        refresh_hz = mode.refresh,
        "selected output"
    );

    Ok(OutputSelection {
        connector_index,
        mode,
        mode_index: selection.index,
        mode_fallback: selection.fallback,
        binding,
    })
}

/// Mode policy: requested name (and rate) if offered, else the first preferred mode,
/// else the largest mode with the first one winning ties.
pub fn select_mode(modes: &[OutputMode], request: Option<&ModeRequest>) -> Option<ModeSelection> {
    let mut fallback = false;
    if let Some(request) = request {
        let requested = modes.iter().position(|mode| {
            mode.name == request.name && request.refresh.is_none_or(|hz| mode.refresh == hz)
        });
        if let Some(index) = requested {
            return Some(ModeSelection {
                index,
                fallback: false,
            });
        }
        tracing::warn!(
            requested = %request,
            "requested mode not found, using default mode"
        );
        fallback = true;
    }

    if let Some(index) = modes.iter().position(|mode| mode.preferred) {
        return Some(ModeSelection { index, fallback });
    }

    let mut best: Option<(usize, u32)> = None;
    for (index, mode) in modes.iter().enumerate() {
        if best.is_none_or(|(_, area)| mode.area() > area) {
            best = Some((index, mode.area()));
        }
    }
    best.map(|(index, _)| ModeSelection { index, fallback })
}

/// Bound encoder's CRTC if still valid, else the first (encoder, CRTC) pairing allowed
/// by an encoder's possible-CRTC mask, CRTCs scanned in resource order.
pub fn resolve_crtc(snapshot: &ResourceSnapshot, connector: &ConnectorSnapshot) -> Result<CrtcBinding> {
    let bind = |encoder_id: u32, crtc_index: usize| CrtcBinding {
        connector_id: connector.id,
        encoder_id,
        crtc_id: snapshot.crtcs[crtc_index],
        crtc_index,
    };

    if let Some(encoder) = connector
        .current_encoder
        .and_then(|id| snapshot.encoder(id))
        && let Some(crtc_id) = encoder.crtc
        && let Some(crtc_index) = snapshot.crtcs.iter().position(|id| *id == crtc_id)
        && crtc_usable(encoder.possible_crtcs, crtc_index)
    {
        return Ok(bind(encoder.id, crtc_index));
    }

    for encoder in connector
        .encoders
        .iter()
        .filter_map(|id| snapshot.encoder(*id))
    {
        if let Some(crtc_index) =
            (0..snapshot.crtcs.len()).find(|index| crtc_usable(encoder.possible_crtcs, *index))
        {
            return Ok(bind(encoder.id, crtc_index));
        }
    }

    Err(DisplayError::NoCrtcAvailable)
}

fn crtc_usable(mask: u32, crtc_index: usize) -> bool {
    crtc_index < u32::BITS as usize && mask & (1 << crtc_index) != 0
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ErrorKind;

    fn mode(name: &str, width: u16, height: u16, refresh: u32, preferred: bool) -> OutputMode {
        OutputMode {
            name: name.to_owned(),
            width,
            height,
            refresh,
            preferred,
            kernel: None,
        }
    }

    fn connector(id: u32, connected: bool, current: Option<u32>, encoders: &[u32]) -> ConnectorSnapshot {
        ConnectorSnapshot {
            id,
            name: format!("HDMI-A-{id}"),
            connected,
            current_encoder: current,
            encoders: encoders.to_vec(),
            modes: vec![mode("1280x720", 1280, 720, 60, true)],
        }
    }

    fn encoder(id: u32, crtc: Option<u32>, possible_crtcs: u32) -> EncoderSnapshot {
        EncoderSnapshot {
            id,
            crtc,
            possible_crtcs,
        }
    }

    #[test]
    fn preferred_beats_larger_mode() {
        let modes = vec![
            mode("1920x1080", 1920, 1080, 60, false),
            mode("1280x720", 1280, 720, 60, true),
        ];
        let selection = select_mode(&modes, None).unwrap();
        assert_eq!(modes[selection.index].name, "1280x720");
        assert!(!selection.fallback);
    }

    #[test]
    fn largest_area_wins_without_preferred_first_on_tie() {
        let modes = vec![
            mode("800x600", 800, 600, 60, false),
            mode("1600x900", 1600, 900, 60, false),
            mode("1200x1200", 1200, 1200, 60, false),
            mode("1600x900", 1600, 900, 75, false),
        ];
        // 1200x1200 = 1_440_000 = 1600x900; the earlier one is kept.
        assert_eq!(select_mode(&modes, None).unwrap().index, 1);
    }

    #[test]
    fn named_mode_with_rate_is_honoured() {
        let modes = vec![
            mode("1920x1080", 1920, 1080, 60, true),
            mode("1024x768", 1024, 768, 75, false),
            mode("1024x768", 1024, 768, 60, false),
        ];
        let selection = select_mode(&modes, Some(&ModeRequest::new("1024x768", Some(60)))).unwrap();
        assert_eq!(selection.index, 2);
        assert!(!selection.fallback);

        let any_rate = select_mode(&modes, Some(&ModeRequest::new("1024x768", None))).unwrap();
        assert_eq!(any_rate.index, 1);
    }

    #[test]
    fn missing_named_mode_falls_back_softly() {
        let modes = vec![
            mode("1920x1080", 1920, 1080, 60, false),
            mode("1280x720", 1280, 720, 60, true),
        ];
        let selection = select_mode(&modes, Some(&ModeRequest::new("1024x768", Some(60)))).unwrap();
        assert_eq!(selection.index, 1);
        assert!(selection.fallback);

        // Right name, wrong rate is also a miss.
        let wrong_rate = select_mode(&modes, Some(&ModeRequest::new("1920x1080", Some(30)))).unwrap();
        assert_eq!(wrong_rate.index, 1);
        assert!(wrong_rate.fallback);
    }

    #[test]
    fn no_modes_means_no_selection() {
        assert_eq!(select_mode(&[], None), None);
    }

    #[test]
    fn first_connected_connector_is_used() {
        let snapshot = ResourceSnapshot {
            connectors: vec![
                connector(40, false, None, &[30]),
                connector(41, true, None, &[31]),
                connector(42, true, None, &[30]),
            ],
            encoders: vec![encoder(30, None, 0b01), encoder(31, None, 0b10)],
            crtcs: vec![100, 101],
        };
        let selection = resolve_output(&snapshot, None).unwrap();
        assert_eq!(selection.connector_index, 1);
        assert_eq!(
            selection.binding,
            CrtcBinding {
                connector_id: 41,
                encoder_id: 31,
                crtc_id: 101,
                crtc_index: 1,
            }
        );
    }

    #[test]
    fn nothing_connected_is_an_error() {
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, false, None, &[30])],
            encoders: vec![encoder(30, None, 1)],
            crtcs: vec![100],
        };
        let err = resolve_output(&snapshot, None).unwrap_err();
        assert!(matches!(err, DisplayError::NoConnectedOutput));
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
    }

    #[test]
    fn selection_carries_the_kernel_mode_it_was_read_with() {
        // Safety: `Mode` wraps a plain C struct of integers and a char array, for which
        // all-zero is a valid value.
        let kernel_mode: Mode = unsafe { std::mem::zeroed() };
        let mut output = connector(41, true, None, &[30]);
        output.modes = vec![
            mode("1920x1080", 1920, 1080, 60, false),
            OutputMode {
                kernel: Some(kernel_mode),
                ..mode("1280x720", 1280, 720, 60, true)
            },
        ];
        let snapshot = ResourceSnapshot {
            connectors: vec![output],
            encoders: vec![encoder(30, None, 1)],
            crtcs: vec![100],
        };

        let selection = resolve_output(&snapshot, None).unwrap();
        assert_eq!(selection.mode_index, 1);
        assert_eq!(selection.mode.kernel, Some(kernel_mode));
    }

    #[test]
    fn connected_connector_without_modes_is_an_error() {
        let mut lonely = connector(40, true, None, &[30]);
        lonely.modes.clear();
        let snapshot = ResourceSnapshot {
            connectors: vec![lonely],
            encoders: vec![encoder(30, None, 1)],
            crtcs: vec![100],
        };
        assert!(matches!(
            resolve_output(&snapshot, None),
            Err(DisplayError::NoModeAvailable)
        ));
    }

    #[test]
    fn bound_encoder_crtc_is_preferred() {
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, true, Some(31), &[30, 31])],
            encoders: vec![encoder(30, None, 0b111), encoder(31, Some(102), 0b100)],
            crtcs: vec![100, 101, 102],
        };
        let binding = resolve_crtc(&snapshot, &snapshot.connectors[0]).unwrap();
        assert_eq!(binding.encoder_id, 31);
        assert_eq!(binding.crtc_id, 102);
        assert_eq!(binding.crtc_index, 2);
    }

    #[test]
    fn stale_bound_encoder_falls_back_to_scan() {
        // The bound encoder no longer exists.
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, true, Some(99), &[30])],
            encoders: vec![encoder(30, None, 0b10)],
            crtcs: vec![100, 101],
        };
        let binding = resolve_crtc(&snapshot, &snapshot.connectors[0]).unwrap();
        assert_eq!((binding.encoder_id, binding.crtc_id), (30, 101));

        // The bound encoder exists but has no CRTC attached.
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, true, Some(30), &[30])],
            encoders: vec![encoder(30, None, 0b01)],
            crtcs: vec![100, 101],
        };
        let binding = resolve_crtc(&snapshot, &snapshot.connectors[0]).unwrap();
        assert_eq!((binding.encoder_id, binding.crtc_id), (30, 100));
    }

    #[test]
    fn index_and_id_are_never_confused() {
        // Kernel ids are deliberately unrelated to array positions, and one id equals
        // another CRTC's index so a mix-up would pick the wrong CRTC.
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, true, None, &[30])],
            encoders: vec![encoder(30, None, 0b100)],
            crtcs: vec![2, 57, 1],
        };
        let binding = resolve_crtc(&snapshot, &snapshot.connectors[0]).unwrap();
        assert_eq!(binding.crtc_index, 2);
        assert_eq!(binding.crtc_id, 1);
    }

    #[test]
    fn missing_encoders_are_skipped() {
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, true, None, &[77, 30])],
            encoders: vec![encoder(30, None, 0b1)],
            crtcs: vec![100],
        };
        let binding = resolve_crtc(&snapshot, &snapshot.connectors[0]).unwrap();
        assert_eq!(binding.encoder_id, 30);
    }

    #[test]
    fn empty_masks_mean_no_crtc() {
        let snapshot = ResourceSnapshot {
            connectors: vec![connector(40, true, None, &[30, 31])],
            encoders: vec![encoder(30, None, 0), encoder(31, None, 0b1000)],
            crtcs: vec![100, 101],
        };
        let err = resolve_crtc(&snapshot, &snapshot.connectors[0]).unwrap_err();
        assert!(matches!(err, DisplayError::NoCrtcAvailable));
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
    }

    proptest! {
        #[test]
        fn resolved_crtc_is_allowed_by_a_reachable_encoder(
            crtc_count in 1usize..8,
            masks in proptest::collection::vec(0u32..256, 1..5),
            bound in proptest::option::of(0usize..5),
        ) {
            let crtcs: Vec<u32> = (0..crtc_count as u32).map(|i| 1000 + i * 7).collect();
            let encoders: Vec<EncoderSnapshot> = masks
                .iter()
                .enumerate()
                .map(|(i, mask)| {
                    // A bound encoder points at its lowest allowed CRTC, or at an id
                    // that is not in the CRTC list when its mask is empty.
                    let crtc = (bound == Some(i)).then(|| {
                        let index = mask.trailing_zeros() as usize;
                        crtcs.get(index).copied().unwrap_or(9999)
                    });
                    encoder(300 + i as u32, crtc, *mask)
                })
                .collect();
            let encoder_ids: Vec<u32> = encoders.iter().map(|e| e.id).collect();
            let current = bound.and_then(|i| encoder_ids.get(i).copied());
            let snapshot = ResourceSnapshot {
                connectors: vec![connector(40, true, current, &encoder_ids)],
                encoders,
                crtcs: crtcs.clone(),
            };

            let any_valid = masks
                .iter()
                .any(|mask| (0..crtc_count).any(|i| crtc_usable(*mask, i)));

            match resolve_crtc(&snapshot, &snapshot.connectors[0]) {
                Ok(binding) => {
                    prop_assert!(any_valid);
                    prop_assert_eq!(crtcs[binding.crtc_index], binding.crtc_id);
                    let encoder = snapshot.encoder(binding.encoder_id).unwrap();
                    prop_assert!(crtc_usable(encoder.possible_crtcs, binding.crtc_index));
                }
                Err(err) => {
                    prop_assert!(!any_valid);
                    prop_assert!(matches!(err, DisplayError::NoCrtcAvailable));
                }
            }
        }
    }
}
