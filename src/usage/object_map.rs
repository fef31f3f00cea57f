// Object-map scanner - computes used space from the RBD allocation bitmap
//
// The object map is a RADOS object named "rbd_object_map.<image_id>" that
// records, per backing object of the image, whether that object has ever
// been written. Decoding it is dramatically cheaper than the external
// `rbd du` query, which can take minutes on a large pool.

use thiserror::Error;

use super::BitmapReader;

/// Name prefix of the object-map object inside the image's pool.
/// The full object name is this prefix followed by the internal image id.
pub const OBJECT_MAP_PREFIX: &str = "rbd_object_map.";

/// Errors that can occur while scanning an object map
///
/// Any of these sends the affected image to the fallback path; a truncated
/// scan never produces a partial used-size.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("object map read failed: {0}")]
    Read(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("object map '{object}' too short: got {got} bytes, need {need}")]
    Truncated {
        object: String,
        got: usize,
        need: usize,
    },
}

/// Scans an image's object map and returns the used size in bytes.
///
/// Each allocation unit is tracked by a 2-bit entry, packed four entries per
/// byte with the first entry in the most significant bits. Entry `i` lives
/// at byte `i / 4`, bit position `6 - 2 * (i % 4)`. Codes 1 and 2 mean the
/// unit is allocated; codes 0 and 3 mean it is not. Entry 0 is the bitmap's
/// reserved slot and is skipped.
///
/// The whole needed range is fetched with a single read and decoded in
/// memory; this is equivalent to one point read per unit, just cheaper.
///
/// # Arguments
/// * `reader` - Byte-range reader for RADOS objects
/// * `pool` - Pool containing the image and its object map
/// * `image_id` - Internal image id (names the object-map object)
/// * `num_objs` - Number of allocation units backing the image
/// * `object_size` - Size of one allocation unit in bytes
///
/// # Returns
/// * `Ok(used_size)` - allocated unit count times `object_size`
/// * `Err(ScanError)` - read failure or truncated object map
pub async fn scan<R: BitmapReader>(
    reader: &R,
    pool: &str,
    image_id: &str,
    num_objs: u64,
    object_size: u64,
) -> Result<u64, ScanError> {
    // Entry 0 is reserved, so an image of at most one unit has nothing to scan
    if num_objs <= 1 {
        return Ok(0);
    }

    let object = format!("{}{}", OBJECT_MAP_PREFIX, image_id);

    // Highest entry index is num_objs - 1, four entries per byte
    let need = ((num_objs - 1) / 4 + 1) as usize;

    let buf = reader
        .read(pool, &object, 0, need)
        .await
        .map_err(ScanError::Read)?;

    if buf.len() < need {
        return Err(ScanError::Truncated {
            object,
            got: buf.len(),
            need,
        });
    }

    let mut allocated: u64 = 0;
    for i in 1..num_objs {
        let byte = buf[(i / 4) as usize];
        let code = (byte >> (6 - 2 * (i % 4))) & 0x3;
        if code == 1 || code == 2 {
            allocated += 1;
        }
    }

    Ok(allocated * object_size)
}
