//! Tunables for a [`crate::manager::Manager`] instance.

use buffer_uploads_device::PlatformCaps;

/// Construction-time configuration for the whole upload engine. Every
/// field has a default matching the shipped C++ engine's behavior.
#[derive(Clone, Debug)]
pub struct BufferUploadsConfig {
    /// Frames an idle pooled resource survives before eviction.
    pub pool_retain_frames: u32,
    /// Byte size of each batched prototype resource.
    pub batched_prototype_size: u32,
    /// Sub-allocation granularity inside a batched prototype.
    pub batched_quantum: u32,
    /// Fraction of free space, unreachable as one block, past which a
    /// batched heap is considered worth compacting.
    pub batched_fragmentation_threshold: f32,
    /// Whether `TickDefrag` is allowed to run at all. Defaults to
    /// `false`, matching the original, which shipped with its
    /// map-based defrag path disabled.
    pub enable_defrag: bool,
    /// Initial slot capacity of the temporary transaction table.
    pub temporary_table_initial_slots: u32,
    /// Slots added when the temporary table is exhausted.
    pub temporary_table_growth_slots: u32,
    /// Initial slot capacity of the long-term transaction table.
    pub long_term_table_initial_slots: u32,
    /// Slots added when the long-term table is exhausted.
    pub long_term_table_growth_slots: u32,
    /// Capacity of each lane in the step queue-set.
    pub queue_capacity_per_lane: usize,
    /// Byte budget consulted by `CommandListBudget` for a normal frame.
    pub command_list_byte_budget: u64,
    /// Step-count budget consulted by `CommandListBudget` for a normal frame.
    pub command_list_step_budget: u32,
}

impl Default for BufferUploadsConfig {
    fn default() -> Self {
        BufferUploadsConfig {
            pool_retain_frames: 8,
            batched_prototype_size: 1 << 20,
            batched_quantum: 16,
            batched_fragmentation_threshold: 0.5,
            enable_defrag: false,
            temporary_table_initial_slots: 256,
            temporary_table_growth_slots: 256,
            long_term_table_initial_slots: 512,
            long_term_table_growth_slots: 512,
            queue_capacity_per_lane: 512,
            command_list_byte_budget: 4 << 20,
            command_list_step_budget: 256,
        }
    }
}

impl BufferUploadsConfig {
    /// Narrow the config's batched/defrag behavior to what `caps`
    /// actually supports on this device.
    pub fn clamp_to(&self, caps: PlatformCaps) -> BufferUploadsConfig {
        let mut config = self.clone();
        if !caps.use_map_based_defrag {
            config.enable_defrag = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_ships_with_defrag_disabled() {
        assert!(!BufferUploadsConfig::default().enable_defrag);
    }

    #[test]
    fn clamp_forces_defrag_off_without_map_based_defrag_support() {
        let config = BufferUploadsConfig {
            enable_defrag: true,
            ..Default::default()
        };
        let caps = PlatformCaps {
            can_do_no_overwrite_map_in_background: true,
            use_map_based_defrag: false,
            supports_resource_initialisation_buffer: true,
            supports_resource_initialisation_texture: true,
        };
        assert!(!config.clamp_to(caps).enable_defrag);
    }
}
