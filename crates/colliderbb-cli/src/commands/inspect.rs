use crate::cli::InspectArgs;
use crate::error::{CliError, Result};
use colliderbb::core::io::checkpoint::load_checkpoint;
use colliderbb::core::models::collider::Collider;
use colliderbb::core::models::ids::{Beam, EncounterKind};
use colliderbb::core::models::knobs::BEAMBEAM_SCALE;
use tracing::info;

/// How far along the pipeline a checkpoint is, judged from its beam-beam record.
fn beambeam_state(collider: &Collider) -> &'static str {
    match collider.beambeam() {
        Err(_) => "not installed",
        Ok(record) if record.lenses.values().all(|l| l.other_beam_population() > 0.0) => "configured",
        Ok(record) if record.lenses.values().any(|l| l.other_beam_population() > 0.0) => {
            "partially configured"
        }
        Ok(_) => "installed, not configured",
    }
}

fn describe(collider: &Collider, list_knobs: bool) -> Vec<String> {
    let mut out = Vec::new();
    out.push(format!("lines ({})", collider.num_lines()));
    for name in collider.line_names() {
        if let Ok(line) = collider.line(name) {
            out.push(format!(
                "  {:<16} {:>6} elements, length {:.4} m, {} long-range, {} head-on",
                name,
                line.elements().len(),
                line.length,
                line.lens_count(EncounterKind::LongRange),
                line.lens_count(EncounterKind::HeadOn),
            ));
        }
    }

    out.push(format!("beam-beam: {}", beambeam_state(collider)));
    if let Ok(record) = collider.beambeam() {
        for settings in &record.ips {
            out.push(format!(
                "  {}: {} long-range per side, delay {} slots",
                settings.ip, settings.num_long_range_per_side, settings.delay_in_slots
            ));
        }
        for beam in Beam::ALL {
            out.push(format!(
                "  {}: {} long-range, {} head-on lenses",
                beam,
                record.count(beam, EncounterKind::LongRange),
                record.count(beam, EncounterKind::HeadOn)
            ));
        }
        if let Some(scale) = collider.knobs().get(BEAMBEAM_SCALE) {
            out.push(format!("  {} = {}", BEAMBEAM_SCALE, scale));
        }
    }

    out.push(format!("knobs ({})", collider.knobs().len()));
    if list_knobs {
        for (name, value) in collider.knobs().iter() {
            let provenance = collider
                .knobs()
                .knob(name)
                .and_then(|k| k.last_provenance())
                .map(|p| p.to_string())
                .unwrap_or_default();
            out.push(format!("  {:<24} {:>14.6e}  {}", name, value, provenance));
        }
    }
    out
}

pub fn run(args: InspectArgs) -> Result<()> {
    info!("Loading collider from {:?}", &args.collider);
    let collider = load_checkpoint(&args.collider).map_err(|e| CliError::FileParsing {
        path: args.collider.clone(),
        source: e.into(),
    })?;
    for line in describe(&collider, args.knobs) {
        println!("{}", line);
    }
    Ok(())
}
