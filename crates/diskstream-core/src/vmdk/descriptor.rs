//! Embedded VMDK descriptor generation.
//!
//! The descriptor is a small UTF-8 text blob stored at sector 1 of a
//! stream-optimized extent, describing the create type, the lone RW
//! extent and the disk database.

use rand::Rng;

/// Content IDs some tooling treats as "no parent" / "all zeroes".
const CID_RESERVED: [u32; 2] = [0xFFFFFFFF, 0xFFFFFFFE];

/// Draw a content ID, rejecting the reserved sentinels.
pub fn generate_cid() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let cid: u32 = rng.gen();
        if !CID_RESERVED.contains(&cid) {
            return cid;
        }
    }
}

/// Render the descriptor for a disk of `capacity_sectors` stored in
/// the extent file `file_name`.
pub fn make_descriptor(file_name: &str, capacity_sectors: u64, cid: u32) -> String {
    let mut rng = rand::thread_rng();
    let cylinders = geometry_cylinders(capacity_sectors);

    format!(
        r#"# Disk DescriptorFile
version=1
encoding="UTF-8"
CID={cid:08x}
parentCID=ffffffff
createType="streamOptimized"

# Extent description
RW {capacity} SPARSE "{file}"

# The Disk Data Base
#DDB

ddb.longContentID = "{r0:08x}{r1:08x}{r2:08x}{cid:08x}"
ddb.virtualHWVersion = "6" # This field is obsolete, used by ESX3.x and older only. Compatible with compat6.
ddb.geometry.cylinders = "{cylinders}"
ddb.geometry.heads = "255" # 255/63 is good for anything bigger than 4GB.
ddb.geometry.sectors = "63"
ddb.adapterType = "lsilogic"
ddb.toolsInstallType = "4" # unmanaged (open-vm-tools)
ddb.toolsVersion = "2147483647" # default is 2^31-1 (unknown)"#,
        cid = cid,
        capacity = capacity_sectors,
        file = file_name,
        r0 = rng.gen::<u32>(),
        r1 = rng.gen::<u32>(),
        r2 = rng.gen::<u32>(),
        cylinders = cylinders,
    )
}

/// 255 heads x 63 sectors geometry, capped at the BIOS cylinder limit.
fn geometry_cylinders(capacity_sectors: u64) -> u32 {
    const HEADS_SECTORS: u64 = 255 * 63;
    if capacity_sectors > 65535 * HEADS_SECTORS {
        65535
    } else {
        ((capacity_sectors + HEADS_SECTORS - 1) / HEADS_SECTORS) as u32
    }
}
