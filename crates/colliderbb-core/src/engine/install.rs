use super::config::BeamBeamInstallConfig;
use super::error::EngineError;
use super::progress::{Progress, ProgressReporter};
use crate::core::models::collider::{BeamBeamRecord, Collider, EncounterRecord, EncounterTables};
use crate::core::models::ids::{Beam, EncounterKind, LensId, Side};
use crate::core::models::knobs::{BEAMBEAM_SCALE, Provenance};
use crate::core::models::lens::BeamBeamLens;
use crate::core::models::line::Element;
use crate::core::slicing::indexed_z_centroids;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Summary of an installation.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallSummary {
    pub long_range_per_line: usize,
    pub head_on_per_line: usize,
}

/// Inserts unconfigured beam-beam lenses around every configured IP of both beam lines.
///
/// Long-range lenses sit at half the bunch spacing times their encounter number from the
/// IP, head-on lenses at half the longitudinal centroid of their slice. The lenses are
/// registered with zero charge and can be filled by
/// [`configure_beambeam_interactions`](super::configure::configure_beambeam_interactions).
#[instrument(skip_all, name = "install_beambeam")]
pub fn install_beambeam_interactions(
    collider: &mut Collider,
    config: &BeamBeamInstallConfig,
    reporter: &ProgressReporter,
) -> Result<InstallSummary, EngineError> {
    if collider.is_beambeam_installed() {
        return Err(EngineError::InvalidState(
            "beam-beam interactions are already installed".to_string(),
        ));
    }

    let centroids = indexed_z_centroids(config.num_slices_head_on, config.sigma_z)?;
    let mut encounters = EncounterTables::default();
    let mut lenses = BTreeMap::new();

    reporter.report(Progress::TaskStart {
        total_steps: (Beam::ALL.len() * config.ips.len()) as u64,
    });

    for beam in Beam::ALL {
        let line_name = beam.line_name();
        let length = collider.line(line_name)?.length;
        let spacing = config.bunch_spacing_ds(length);
        let table = encounters.for_beam_mut(beam);

        for settings in &config.ips {
            let s_ip = collider.element_s(line_name, &settings.ip.name())?;
            let mut placed: Vec<(LensId, f64, Option<f64>)> = Vec::new();

            for side in [Side::Left, Side::Right] {
                for i in 0..settings.num_long_range_per_side {
                    let id = LensId::long_range(settings.ip, side, beam, (i + 1) as u16);
                    let offset = spacing / 2.0 * (i + 1) as f64 * beam.sorting(side);
                    placed.push((id, offset, None));
                }
            }
            for &(slice_index, z) in &centroids {
                let id = LensId::head_on(settings.ip, beam, slice_index);
                placed.push((id, z / 2.0, Some(z)));
            }

            let line = collider.line_mut(line_name)?;
            for (id, offset, z_centroid) in placed {
                let s_position = line.wrap_s(s_ip + offset);
                debug!(lens = %id, s = s_position, "Installing beam-beam lens.");
                line.insert(Element::beambeam(id, s_position));
                lenses.insert(id, BeamBeamLens::unconfigured(id.kind));
                table.push(EncounterRecord {
                    element_name: id,
                    s_offset: offset,
                    s_position,
                    z_centroid,
                    delay_in_slots: settings.delay_in_slots,
                });
            }
            reporter.report(Progress::TaskIncrement);
        }
    }
    reporter.report(Progress::TaskFinish);

    collider.set_beambeam(BeamBeamRecord {
        harmonic_number: config.harmonic_number,
        bunch_spacing_buckets: config.bunch_spacing_buckets,
        sigma_z: config.sigma_z,
        num_slices_head_on: config.num_slices_head_on,
        ips: config.ips.clone(),
        encounters,
        lenses,
    });
    collider.set_knob(BEAMBEAM_SCALE, 1.0, Provenance::BeamBeamInstall)?;

    let summary = InstallSummary {
        long_range_per_line: collider.beam_line(Beam::B1)?.lens_count(EncounterKind::LongRange),
        head_on_per_line: collider.beam_line(Beam::B1)?.lens_count(EncounterKind::HeadOn),
    };
    info!(
        long_range = summary.long_range_per_line,
        head_on = summary.head_on_per_line,
        ips = config.ips.len(),
        "Beam-beam lenses installed."
    );
    Ok(summary)
}

/// Removes every beam-beam lens and the installation record.
pub fn remove_beambeam_interactions(collider: &mut Collider) -> Result<usize, EngineError> {
    let mut removed = 0;
    for beam in Beam::ALL {
        removed += collider.line_mut(beam.line_name())?.remove_lenses();
    }
    collider.take_beambeam();
    info!(removed, "Beam-beam lenses removed.");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::Ip;
    use crate::core::slicing::z_centroids;
    use crate::engine::testing::{hllhc_install_config, synthetic_collider};

    fn installed() -> Collider {
        let mut collider = synthetic_collider();
        install_beambeam_interactions(&mut collider, &hllhc_install_config(), &ProgressReporter::new())
            .unwrap();
        collider
    }

    #[test]
    fn lens_counts_match_configuration() {
        let collider = installed();
        for beam in Beam::ALL {
            let line = collider.beam_line(beam).unwrap();
            assert_eq!(line.lens_count(EncounterKind::LongRange), 2 * (25 + 20 + 25 + 20));
            assert_eq!(line.lens_count(EncounterKind::HeadOn), 4 * 11);
        }
        let bb = collider.beambeam().unwrap();
        assert_eq!(bb.lenses.len(), 2 * (180 + 44));
        assert_eq!(bb.encounters.clockwise.len(), 224);
        assert_eq!(bb.encounters.anticlockwise.len(), 224);
    }

    #[test]
    fn long_range_lenses_sit_at_half_bunch_spacing() {
        let collider = installed();
        let spacing = hllhc_install_config().bunch_spacing_ds(collider.beam_line(Beam::B1).unwrap().length);
        for beam in Beam::ALL {
            let line = beam.line_name();
            let s_ip = collider.element_s(line, "ip5").unwrap();
            for (side, i) in [(Side::Left, 1u16), (Side::Right, 25)] {
                let id = LensId::long_range(Ip::IP5, side, beam, i);
                let s = collider.element_s(line, &id.to_string()).unwrap();
                let expected = spacing / 2.0 * f64::from(i) * beam.sorting(side);
                assert!((s - s_ip - expected).abs() < 1e-9, "{}", id);
            }
        }
    }

    #[test]
    fn head_on_lenses_sit_at_half_the_slice_centroid() {
        let collider = installed();
        let centroids = z_centroids(11, 0.076).unwrap();
        for beam in Beam::ALL {
            let line = beam.line_name();
            let s_ip = collider.element_s(line, "ip1").unwrap();
            for (k, z) in centroids.iter().enumerate() {
                let id = LensId::head_on(Ip::IP1, beam, k as i32 - 5);
                let s = collider.element_s(line, &id.to_string()).unwrap();
                let offset = collider.beam_line(beam).unwrap().wrap_s(s - s_ip + 1000.0) - 1000.0;
                assert!((offset - z / 2.0).abs() < 1e-9, "{}", id);
            }
        }
    }

    #[test]
    fn lenses_wrap_around_the_ring_start() {
        let collider = installed();
        let line = collider.beam_line(Beam::B1).unwrap();
        let s = collider
            .element_s("lhcb1", "bb_lr.l1b1_01")
            .unwrap();
        assert!(s > line.length / 2.0 && s < line.length);
    }

    #[test]
    fn installation_registers_scale_knob_and_delays() {
        let collider = installed();
        assert_eq!(collider.knob(BEAMBEAM_SCALE).unwrap(), 1.0);
        let bb = collider.beambeam().unwrap();
        let ip8 = bb
            .encounters
            .anticlockwise
            .iter()
            .find(|r| r.element_name.ip == Ip::IP8)
            .unwrap();
        assert_eq!(ip8.delay_in_slots, 2670);
        assert!(bb.lenses.values().all(|l| l.other_beam_population() == 0.0));
    }

    #[test]
    fn second_installation_is_rejected_until_removed() {
        let mut collider = installed();
        let config = hllhc_install_config();
        assert!(matches!(
            install_beambeam_interactions(&mut collider, &config, &ProgressReporter::new()),
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(remove_beambeam_interactions(&mut collider).unwrap(), 2 * 224);
        assert!(install_beambeam_interactions(&mut collider, &config, &ProgressReporter::new()).is_ok());
    }
}
