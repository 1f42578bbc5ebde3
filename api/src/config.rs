/// Allows configuring a virtual machine before it is created.
///
/// Passed to `create_vm`; the monitor keeps a copy for the lifetime of the
/// machine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub struct VmConfig {
    /// The amount of guest memory in KiB.
    ///
    /// The first megabyte is always present (conventional memory plus the
    /// read-only adapter/BIOS window); anything beyond it is reported as
    /// extended memory and mapped on first touch.
    pub memory_kib: u32,

    /// The virtual console the guest's output is attached to.
    pub display: u8,

    /// Whether accesses to ports no handler claims are logged.
    ///
    /// Guests probe freely for hardware that is not there, so embedders
    /// usually leave this off outside of bring-up.
    pub log_unclaimed_ports: bool,
}

impl VmConfig {
    /// Creates a new default configuration with the following values:
    ///
    /// - `memory_kib`: 4 MiB
    /// - `display`: 0
    /// - `log_unclaimed_ports`: disabled
    pub const fn new_default() -> Self {
        Self {
            memory_kib: 4 * 1024,
            display: 0,
            log_unclaimed_ports: false,
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new_default()
    }
}
