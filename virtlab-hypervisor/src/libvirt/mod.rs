//! Libvirt hypervisor backend.
//!
//! Requires the `libvirt` feature and a system libvirt installation.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;

/// Check if libvirt backend is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_follows_feature() {
        assert_eq!(is_available(), cfg!(feature = "libvirt"));
    }
}
