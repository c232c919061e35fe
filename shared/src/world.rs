use crate::model::{PuzzleFlags, Vec3};

pub const EXIT_DOOR_CENTER: Vec3 = Vec3 {
    x: 0.0,
    y: 5.0,
    z: -49.0,
};
pub const EXIT_DOOR_SIZE: Vec3 = Vec3 {
    x: 4.0,
    y: 10.0,
    z: 1.0,
};
pub const EXIT_MARGIN: f32 = 1.0;
pub const GROUND_FLOOR_BAND: (f32, f32) = (0.0, 10.0);

/// Region a participant must stand in to leave through the exit.
///
/// The horizontal extent comes from the door box; height is judged against
/// `floor_band` alone so that eye height does not matter, only which storey
/// the participant is on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitVolume {
    pub min: Vec3,
    pub max: Vec3,
    pub floor_band: (f32, f32),
}

impl ExitVolume {
    pub fn from_box(center: Vec3, size: Vec3, margin: f32, floor_band: (f32, f32)) -> Self {
        let half_x = size.x / 2.0 + margin;
        let half_y = size.y / 2.0 + margin;
        let half_z = size.z / 2.0 + margin;
        Self {
            min: Vec3::new(center.x - half_x, center.y - half_y, center.z - half_z),
            max: Vec3::new(center.x + half_x, center.y + half_y, center.z + half_z),
            floor_band,
        }
    }

    pub fn contains(&self, position: &Vec3) -> bool {
        let (floor_min, floor_max) = self.floor_band;
        position.x >= self.min.x
            && position.x <= self.max.x
            && position.z >= self.min.z
            && position.z <= self.max.z
            && position.y >= floor_min
            && position.y <= floor_max
    }
}

impl Default for ExitVolume {
    fn default() -> Self {
        Self::from_box(
            EXIT_DOOR_CENTER,
            EXIT_DOOR_SIZE,
            EXIT_MARGIN,
            GROUND_FLOOR_BAND,
        )
    }
}

/// The exit opens only when every lock is released and the participant
/// stands inside the exit volume on the right floor.
pub fn exit_reachable(flags: &PuzzleFlags, position: &Vec3, exit: &ExitVolume) -> bool {
    flags.all_unlocked() && exit.contains(position)
}
