use colliderbb::core::models::ids::Ip;

/// HL-LHC round optics at top energy.
pub struct DefaultsConfig {
    pub ips: Vec<Ip>,
    pub delay_at_ips_slots: Vec<u32>,
    pub num_long_range_encounters_per_side: Vec<usize>,
    pub num_slices_head_on: usize,
    pub harmonic_number: u32,
    pub bunch_spacing_buckets: u32,
    pub sigma_z: f64,
    pub num_particles: f64,
    pub nemitt_x: f64,
    pub nemitt_y: f64,
    pub num_colliding_bunches: Vec<(Ip, u32)>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            ips: vec![Ip::IP1, Ip::IP2, Ip::IP5, Ip::IP8],
            delay_at_ips_slots: vec![0, 891, 0, 2670],
            num_long_range_encounters_per_side: vec![25, 20, 25, 20],
            num_slices_head_on: 11,
            harmonic_number: 35640,
            bunch_spacing_buckets: 10,
            sigma_z: 0.076,
            num_particles: 2.2e11,
            nemitt_x: 2.5e-6,
            nemitt_y: 2.5e-6,
            num_colliding_bunches: vec![
                (Ip::IP1, 2748),
                (Ip::IP2, 2494),
                (Ip::IP5, 2748),
                (Ip::IP8, 2572),
            ],
        }
    }
}

impl DefaultsConfig {
    pub fn num_colliding_bunches(&self, ip: Ip) -> Option<u32> {
        self.num_colliding_bunches
            .iter()
            .find(|(i, _)| *i == ip)
            .map(|(_, n)| *n)
    }
}
