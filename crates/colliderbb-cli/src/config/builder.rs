use super::defaults::DefaultsConfig;
use super::file::{FileBeamBeamConfig, FileConfig, FileVerifyConfig};
use super::models::{InstallJob, VerifyJob};
use crate::cli::{InstallArgs, LuminosityArgs, VerifyArgs};
use crate::error::{CliError, Result};
use colliderbb::core::models::ids::{Beam, Ip};
use colliderbb::engine::backend::ExportedTables;
use colliderbb::engine::config as core_config;
use std::str::FromStr;

pub fn build_install_job(args: &InstallArgs) -> Result<InstallJob> {
    let defaults = DefaultsConfig::default();
    let file_config = FileConfig::from_optional_file(args.config.as_deref())?;
    let mut file_config = apply_set_values(file_config, &args.set_values)?;
    let install = file_config.install.take().unwrap_or_default();

    let ips = match install.ips {
        Some(names) => names.iter().map(|n| parse_id::<Ip>(n, "install.ips")).collect::<Result<_>>()?,
        None => defaults.ips,
    };
    let num_slices_head_on = args
        .num_slices_head_on
        .or(install.num_slices_head_on)
        .unwrap_or(defaults.num_slices_head_on);
    let sigma_z = args.sigma_z.or(install.sigma_z).unwrap_or(defaults.sigma_z);

    let install = core_config::BeamBeamInstallConfig::builder()
        .ips(ips)
        .delay_at_ips_slots(install.delay_at_ips_slots.unwrap_or(defaults.delay_at_ips_slots))
        .num_long_range_encounters_per_side(
            install
                .num_long_range_encounters_per_side
                .unwrap_or(defaults.num_long_range_encounters_per_side),
        )
        .num_slices_head_on(num_slices_head_on)
        .harmonic_number(install.harmonic_number.unwrap_or(defaults.harmonic_number))
        .bunch_spacing_buckets(install.bunch_spacing_buckets.unwrap_or(defaults.bunch_spacing_buckets))
        .sigma_z(sigma_z)
        .build()
        .map_err(|e| CliError::Config(e.to_string()))?;

    Ok(InstallJob {
        input_path: args.input.clone(),
        output_path: args.output.clone(),
        install,
    })
}

pub fn build_luminosity_params(args: &LuminosityArgs) -> Result<core_config::LuminosityParams> {
    let defaults = DefaultsConfig::default();
    let file_config = FileConfig::from_optional_file(args.config.as_deref())?;
    let lumi = file_config.luminosity.unwrap_or_default();

    let from_file = match &lumi.num_colliding_bunches {
        Some(map) => lookup_by_id::<Ip, _>(map, args.ip, "luminosity.num-colliding-bunches")?,
        None => None,
    };
    let num_colliding_bunches = args
        .num_colliding_bunches
        .or(from_file)
        .or_else(|| defaults.num_colliding_bunches(args.ip))
        .ok_or_else(|| {
            CliError::Config(format!("no number of colliding bunches known for {}", args.ip))
        })?;

    let params = core_config::LuminosityParams {
        ip: args.ip,
        num_colliding_bunches,
        num_particles_per_bunch: args
            .num_particles_per_bunch
            .or(lumi.num_particles_per_bunch)
            .unwrap_or(defaults.num_particles),
        nemitt_x: args.nemitt_x.or(lumi.nemitt_x).unwrap_or(defaults.nemitt_x),
        nemitt_y: args.nemitt_y.or(lumi.nemitt_y).unwrap_or(defaults.nemitt_y),
        sigma_z: args.sigma_z.or(lumi.sigma_z).unwrap_or(defaults.sigma_z),
        crab: args.crab || lumi.crab.unwrap_or(false),
    };
    params.validate().map_err(|e| CliError::Config(e.to_string()))?;
    Ok(params)
}

pub fn build_verify_job(args: &VerifyArgs) -> Result<VerifyJob> {
    let defaults = DefaultsConfig::default();
    let mut file_config = FileConfig::from_optional_file(args.config.as_deref())?;
    let beambeam = merge_beambeam(file_config.beam_beam.take(), &defaults)?;
    let verify = merge_verify(file_config.verify.take(), beambeam, args.with_tunes)?;

    Ok(VerifyJob {
        collider_path: args.collider.clone(),
        tables: ExportedTables::new(&args.twiss_dir, &args.survey_dir),
        verify,
    })
}

fn merge_beambeam(
    file_val: Option<FileBeamBeamConfig>,
    defaults: &DefaultsConfig,
) -> Result<core_config::BeamBeamParams> {
    let file_val = file_val.unwrap_or_default();
    let mut params = core_config::BeamBeamParams::new(
        file_val.num_particles.unwrap_or(defaults.num_particles),
        file_val.nemitt_x.unwrap_or(defaults.nemitt_x),
        file_val.nemitt_y.unwrap_or(defaults.nemitt_y),
    );
    if let Some(zeta) = file_val.crab_zeta_offset {
        params.crab_zeta_offset = zeta;
    }
    if let Some(v) = file_val.min_sigma_diff {
        params.min_sigma_diff = v;
    }
    if let Some(v) = file_val.threshold_singular {
        params.threshold_singular = v;
    }
    params.validate().map_err(|e| CliError::Config(e.to_string()))?;
    Ok(params)
}

fn merge_verify(
    file_val: Option<FileVerifyConfig>,
    beambeam: core_config::BeamBeamParams,
    with_tunes: bool,
) -> Result<core_config::VerifyConfig> {
    let file_val = file_val.unwrap_or_default();
    let mut verify = core_config::VerifyConfig::new(beambeam);
    if let Some(shift) = file_val.expected_tune_shift {
        verify.expected_tune_shift = shift;
    }
    if let Some(atol) = file_val.tune_shift_atol {
        verify.tune_shift_atol = atol;
    }
    verify.crossing_tilts = file_val
        .crossing_tilts
        .unwrap_or_default()
        .iter()
        .map(|(name, tilt)| Ok((parse_id::<Ip>(name, "verify.crossing-tilts")?, *tilt)))
        .collect::<Result<_>>()?;
    verify.bb_off_tunes = file_val
        .bb_off_tunes
        .unwrap_or_default()
        .iter()
        .map(|(name, [qx, qy])| Ok((parse_id::<Beam>(name, "verify.bb-off-tunes")?, *qx, *qy)))
        .collect::<Result<_>>()?;
    // Exported tables do not follow the scale knob, so tunes are only compared on request.
    verify.check_tunes = with_tunes || file_val.check_tunes.unwrap_or(false);
    Ok(verify)
}

fn parse_id<T>(name: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    name.parse()
        .map_err(|e: T::Err| CliError::Config(format!("Invalid entry '{}' in {}: {}", name, key, e)))
}

fn lookup_by_id<T, V>(map: &std::collections::BTreeMap<String, V>, id: T, key: &str) -> Result<Option<V>>
where
    T: FromStr + PartialEq,
    T::Err: std::fmt::Display,
    V: Copy,
{
    for (name, value) in map {
        if parse_id::<T>(name, key)? == id {
            return Ok(Some(*value));
        }
    }
    Ok(None)
}

fn apply_set_values(mut config: FileConfig, set_values: &[String]) -> Result<FileConfig> {
    for kv_pair in set_values {
        let Some((key, value_str)) = kv_pair.split_once('=') else {
            return Err(CliError::Config(format!(
                "Invalid --set format: '{}'. Expected KEY=VALUE.",
                kv_pair
            )));
        };
        let install = config.install.get_or_insert_with(Default::default);

        match key {
            "install.num-slices-head-on" => {
                install.num_slices_head_on = Some(value_str.parse().map_err(|_| {
                    CliError::Config(format!("Invalid integer value for {}: {}", key, value_str))
                })?);
            }
            "install.harmonic-number" => {
                install.harmonic_number = Some(value_str.parse().map_err(|_| {
                    CliError::Config(format!("Invalid integer value for {}: {}", key, value_str))
                })?);
            }
            "install.bunch-spacing-buckets" => {
                install.bunch_spacing_buckets = Some(value_str.parse().map_err(|_| {
                    CliError::Config(format!("Invalid integer value for {}: {}", key, value_str))
                })?);
            }
            "install.sigma-z" => {
                install.sigma_z = Some(value_str.parse().map_err(|_| {
                    CliError::Config(format!("Invalid float value for {}: {}", key, value_str))
                })?);
            }
            _ => {
                return Err(CliError::Config(format!(
                    "Unsupported configuration key for --set: '{}'",
                    key
                )));
            }
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn base_install_args() -> InstallArgs {
        InstallArgs {
            input: PathBuf::from("collider_00.json"),
            output: PathBuf::from("collider_01.json"),
            config: None,
            num_slices_head_on: None,
            sigma_z: None,
            set_values: vec![],
        }
    }

    fn base_luminosity_args() -> LuminosityArgs {
        LuminosityArgs {
            twiss_b1: PathBuf::from("twiss_lhcb1.csv"),
            twiss_b2: PathBuf::from("twiss_lhcb2.csv"),
            ip: Ip::IP8,
            config: None,
            num_colliding_bunches: None,
            num_particles_per_bunch: None,
            nemitt_x: None,
            nemitt_y: None,
            sigma_z: None,
            crab: false,
        }
    }

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn install_defaults_describe_hl_lhc() {
        let job = build_install_job(&base_install_args()).expect("build ok");
        let install = job.install;
        assert_eq!(install.ips.len(), 4);
        assert_eq!(install.ips[1].ip, Ip::IP2);
        assert_eq!(install.ips[1].delay_in_slots, 891);
        assert_eq!(install.ips[3].num_long_range_per_side, 20);
        assert_eq!(install.num_slices_head_on, 11);
        assert_eq!(install.harmonic_number, 35640);
        assert_eq!(install.bunch_spacing_buckets, 10);
        assert_eq!(install.sigma_z, 0.076);
    }

    #[test]
    fn install_file_values_and_cli_overrides_merge() {
        let (_dir, path) = write_config(
            r#"
            [install]
            ips = ["ip1", "ip5"]
            delay-at-ips-slots = [0, 0]
            num-long-range-encounters-per-side = [16, 16]
            num-slices-head-on = 7
            sigma-z = 0.09
            "#,
        );
        let mut args = base_install_args();
        args.config = Some(path);
        args.sigma_z = Some(0.08);

        let install = build_install_job(&args).expect("build ok").install;
        assert_eq!(install.ips.iter().map(|s| s.ip).collect::<Vec<_>>(), [Ip::IP1, Ip::IP5]);
        assert_eq!(install.num_slices_head_on, 7);
        assert_eq!(install.sigma_z, 0.08);
    }

    #[test]
    fn set_values_override_file() {
        let mut args = base_install_args();
        args.set_values = vec![
            "install.num-slices-head-on=5".to_string(),
            "install.harmonic-number=3564".to_string(),
            "install.sigma-z=0.1".to_string(),
        ];
        let install = build_install_job(&args).expect("build ok").install;
        assert_eq!(install.num_slices_head_on, 5);
        assert_eq!(install.harmonic_number, 3564);
        assert!((install.sigma_z - 0.1).abs() < 1e-15);
    }

    #[test]
    fn invalid_set_values_are_rejected() {
        for bad in ["install.sigma-z", "install.sigma-z=short", "install.unknown=1"] {
            let mut args = base_install_args();
            args.set_values = vec![bad.to_string()];
            assert!(matches!(build_install_job(&args), Err(CliError::Config(_))), "{}", bad);
        }
    }

    #[test]
    fn even_slice_count_fails_in_core_builder() {
        let mut args = base_install_args();
        args.num_slices_head_on = Some(10);
        assert!(matches!(build_install_job(&args), Err(CliError::Config(_))));
    }

    #[test]
    fn unknown_keys_in_file_are_rejected() {
        let (_dir, path) = write_config("[install]\nnum-slices = 11\n");
        let mut args = base_install_args();
        args.config = Some(path);
        assert!(matches!(build_install_job(&args), Err(CliError::FileParsing { .. })));
    }

    #[test]
    fn bad_ip_name_is_reported_with_key() {
        let (_dir, path) = write_config("[install]\nips = [\"ip9\"]\n");
        let mut args = base_install_args();
        args.config = Some(path);
        match build_install_job(&args) {
            Err(CliError::Config(message)) => assert!(message.contains("install.ips")),
            _ => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn luminosity_bunch_count_follows_precedence() {
        let args = base_luminosity_args();
        assert_eq!(build_luminosity_params(&args).unwrap().num_colliding_bunches, 2572);

        let (_dir, path) = write_config(
            r#"
            [luminosity]
            num-colliding-bunches = { ip8 = 2400 }
            nemitt-x = 2.0e-6
            crab = true
            "#,
        );
        let mut args = base_luminosity_args();
        args.config = Some(path);
        let params = build_luminosity_params(&args).unwrap();
        assert_eq!(params.num_colliding_bunches, 2400);
        assert_eq!(params.nemitt_x, 2.0e-6);
        assert_eq!(params.nemitt_y, 2.5e-6);
        assert!(params.crab);

        args.num_colliding_bunches = Some(100);
        assert_eq!(build_luminosity_params(&args).unwrap().num_colliding_bunches, 100);
    }

    #[test]
    fn luminosity_without_bunch_count_is_a_config_error() {
        let mut args = base_luminosity_args();
        args.ip = Ip::new(3).unwrap();
        assert!(matches!(build_luminosity_params(&args), Err(CliError::Config(_))));
    }

    #[test]
    fn verify_job_reads_tunes_and_tilts() {
        let (_dir, path) = write_config(
            r#"
            [beam-beam]
            num-particles = 1.8e11
            nemitt-x = 2.0e-6
            nemitt-y = 3.0e-6

            [verify]
            expected-tune-shift = -0.012
            crossing-tilts = { ip8 = -0.015 }
            bb-off-tunes = { lhcb1 = [62.31, 60.32], lhcb2 = [62.315, 60.325] }
            "#,
        );
        let args = VerifyArgs {
            collider: PathBuf::from("collider_04.json"),
            twiss_dir: PathBuf::from("twiss"),
            survey_dir: PathBuf::from("survey"),
            config: Some(path),
            with_tunes: false,
        };
        let job = build_verify_job(&args).unwrap();
        let verify = job.verify;
        assert_eq!(verify.beambeam.num_particles, 1.8e11);
        assert_eq!(verify.expected_tune_shift, -0.012);
        assert_eq!(verify.crossing_tilt(Ip::IP8), -0.015);
        assert_eq!(verify.bb_off_tunes(Beam::B2), Some((62.315, 60.325)));
        assert!(!verify.check_tunes);
        assert_eq!(
            job.tables.twiss_path(Beam::B1, &Default::default()),
            PathBuf::from("twiss/twiss_lhcb1.csv")
        );
    }
}
