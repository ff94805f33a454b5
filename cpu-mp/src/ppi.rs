// SPDX-License-Identifier: MPL-2.0

//! Publication of interfaces to the other boot-phase components.
//!
//! Interfaces are installed once under a GUID and located by GUID. The same
//! interface may be installed under several GUIDs.

use alloc::{sync::Arc, vec::Vec};
use core::{any::Any, fmt};

use spin::Mutex;

use crate::{prelude::Result, services::MpServices2};

/// A globally unique identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl Guid {
    /// Creates a GUID from its fields.
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// The GUID of the classic multiprocessor services.
pub const EFI_PEI_MP_SERVICES_PPI_GUID: Guid = Guid::new(
    0xee16160a,
    0xe8be,
    0x47a6,
    [0x82, 0x0a, 0xc6, 0x90, 0x0d, 0xb0, 0x25, 0x0a],
);

/// The GUID of the multiprocessor services with `StartupAllCPUs`.
pub const EDKII_PEI_MP_SERVICES2_PPI_GUID: Guid = Guid::new(
    0x5cb9cb3d,
    0x31a4,
    0x480c,
    [0x94, 0x98, 0x29, 0xd2, 0x69, 0xba, 0xcf, 0xba],
);

/// The GUID of the built-in self test results.
pub const EFI_SEC_PLATFORM_INFORMATION2_PPI_GUID: Guid = Guid::new(
    0x9e9f374b,
    0x8f16,
    0x4230,
    [0x98, 0x24, 0x58, 0x46, 0xee, 0x76, 0x6a, 0x97],
);

/// An interface installed under a GUID.
#[derive(Clone)]
pub struct PpiDescriptor {
    /// The GUID the interface is installed under.
    pub guid: Guid,
    /// The interface.
    pub interface: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for PpiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PpiDescriptor")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

/// The database of installed interfaces.
pub trait PpiDatabase: Send + Sync {
    /// Installs interfaces.
    fn install(&self, descriptors: &[PpiDescriptor]) -> Result<()>;

    /// Returns the first interface installed under `guid`.
    fn locate(&self, guid: &Guid) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// An in-memory [`PpiDatabase`].
#[derive(Default)]
pub struct PpiTable {
    entries: Mutex<Vec<PpiDescriptor>>,
}

impl PpiTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of installed interfaces.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PpiDatabase for PpiTable {
    fn install(&self, descriptors: &[PpiDescriptor]) -> Result<()> {
        let mut entries = self.entries.lock();
        for descriptor in descriptors {
            log::debug!("Installing PPI {}", descriptor.guid);
            entries.push(descriptor.clone());
        }
        Ok(())
    }

    fn locate(&self, guid: &Guid) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .lock()
            .iter()
            .find(|descriptor| descriptor.guid == *guid)
            .map(|descriptor| descriptor.interface.clone())
    }
}

/// The interface installed under the multiprocessor services GUIDs.
pub type MpServicesInterface = Arc<dyn MpServices2>;

/// Locates the multiprocessor services installed under `guid`.
pub fn locate_mp_services(database: &dyn PpiDatabase, guid: &Guid) -> Option<MpServicesInterface> {
    database
        .locate(guid)?
        .downcast_ref::<MpServicesInterface>()
        .cloned()
}

/// Locates a value of type `T` installed under `guid`.
pub fn locate<T: Any + Send + Sync>(database: &dyn PpiDatabase, guid: &Guid) -> Option<Arc<T>> {
    database.locate(guid)?.downcast::<T>().ok()
}
