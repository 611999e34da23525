//! Firmware and radio image loading.
//!
//! Images consist of a little endian checksum, a little endian size and `size` bytes of big
//! endian words. The checksum is the sum of all bytes after the checksum field, i.e. of the size
//! field and of the data.
//!
//! Images are always streamed through the slave memory registers, regardless of the transport.
//! By default the chip increments the address on every data access. With the `fw-no-autoinc`
//! feature enabled, every word is addressed explicitly.

use crate::{
    cmd::{CmdCode, CmdError, CommandPort, MailboxPort},
    ie::MemoryMap,
    regs::{IrqStatus, Reg, ECPU_CTRL_HALT, ECPU_CTRL_RUN, HW_ABSENT_16, SOFT_RESET_BIT},
    transport::Transport,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoadError {
    /// The image is shorter than its header.
    ImageTruncated,
    /// The size field doesn't match the image, or isn't a multiple of four.
    SizeMismatch,
    /// The byte sum doesn't match the embedded checksum.
    ChecksumMismatch,
    /// A word read back from the chip differs from what was written.
    ReadbackMismatch { offset: u32 },
    /// All upload attempts failed.
    FirmwareUploadFailed,
    /// The firmware didn't signal, that it finished initialization.
    InitTimeout,
    /// A register read returned all ones.
    HardwareAbsent,
    Command(CmdError),
}
impl From<CmdError> for LoadError {
    fn from(value: CmdError) -> Self {
        Self::Command(value)
    }
}

/// How often the write and validate cycle is attempted.
pub const UPLOAD_ATTEMPTS: usize = 5;
/// Delay between two upload attempts.
pub const UPLOAD_RETRY_DELAY_MS: u32 = 1000;
/// The firmware signals init completion within this many polls.
pub const INIT_POLLS: usize = 40;
pub const INIT_POLL_INTERVAL_MS: u32 = 50;

const HEADER_LEN: usize = 8;
/// Settle time after selecting an address.
const ADDR_SETTLE_US: u32 = 10;

fn byte_sum(word: u32) -> u32 {
    word.to_le_bytes().iter().map(|byte| *byte as u32).sum()
}

/// A parsed firmware or radio image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirmwareImage<'a> {
    checksum: u32,
    size: u32,
    data: &'a [u8],
}
impl<'a> FirmwareImage<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, LoadError> {
        if raw.len() < HEADER_LEN {
            return Err(LoadError::ImageTruncated);
        }
        let (header, data) = raw.split_at(HEADER_LEN);
        let checksum = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if size as usize != data.len() || size % 4 != 0 {
            return Err(LoadError::SizeMismatch);
        }
        Ok(Self {
            checksum,
            size,
            data,
        })
    }
    /// The checksum embedded in the image.
    pub const fn checksum(&self) -> u32 {
        self.checksum
    }
    /// The length of the data in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }
    /// Sum up size field and data, the way the embedded checksum was calculated.
    pub fn compute_checksum(&self) -> u32 {
        self.data
            .iter()
            .fold(byte_sum(self.size), |sum, byte| sum.wrapping_add(*byte as u32))
    }
    /// The words, that get written to the chip.
    pub fn words(&self) -> impl Iterator<Item = u32> + 'a {
        self.data
            .chunks_exact(4)
            .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
    }
}

/// Point the slave memory interface at `offset`, in the addressing mode used for uploads.
fn select_upload_mode<T: Transport>(transport: &mut T, offset: u32) {
    transport.write32(Reg::SlvEndCtl, 0);
    cfg_if::cfg_if! {
        if #[cfg(feature = "fw-no-autoinc")] {
            let _ = offset;
            transport.write32(Reg::SlvMemCtl, crate::regs::SLV_MEM_CTL_BASIC);
        } else {
            transport.write32(Reg::SlvMemCtl, crate::regs::SLV_MEM_CTL_AUTOINC);
            transport.write32(Reg::SlvMemAddr, offset);
            transport.udelay(ADDR_SETTLE_US);
        }
    }
}
#[inline]
fn select_word<T: Transport>(transport: &mut T, addr: u32) {
    if cfg!(feature = "fw-no-autoinc") {
        transport.write32(Reg::SlvMemAddr, addr);
        transport.udelay(ADDR_SETTLE_US);
    } else {
        let _ = (transport, addr);
    }
}

/// Stream the image to `offset` in chip memory.
pub fn write_image<T: Transport>(
    transport: &mut T,
    image: &FirmwareImage<'_>,
    offset: u32,
) -> Result<(), LoadError> {
    select_upload_mode(transport, offset);
    let mut sum = byte_sum(image.size);
    for (i, word) in image.words().enumerate() {
        select_word(transport, offset + i as u32 * 4);
        transport.write32(Reg::SlvMemData, word);
        sum = sum.wrapping_add(byte_sum(word));
    }
    if sum != image.checksum {
        warn!(
            "Image checksum mismatch while writing: expected {:x}, got {:x}",
            image.checksum, sum
        );
        return Err(LoadError::ChecksumMismatch);
    }
    Ok(())
}

/// Read the image back from `offset` and compare it.
///
/// Every word is read, even after a mismatch, so that the checksum is always calculated over
/// what actually ended up in chip memory.
pub fn validate_image<T: Transport>(
    transport: &mut T,
    image: &FirmwareImage<'_>,
    offset: u32,
) -> Result<(), LoadError> {
    select_upload_mode(transport, offset);
    let mut sum = byte_sum(image.size);
    let mut first_mismatch = None;
    for (i, expected) in image.words().enumerate() {
        let addr = offset + i as u32 * 4;
        select_word(transport, addr);
        let actual = transport.read32(Reg::SlvMemData);
        sum = sum.wrapping_add(byte_sum(actual));
        if actual != expected && first_mismatch.is_none() {
            first_mismatch = Some(addr);
        }
    }
    if sum != image.checksum {
        warn!(
            "Image checksum mismatch while validating: expected {:x}, got {:x}",
            image.checksum, sum
        );
        return Err(LoadError::ChecksumMismatch);
    }
    if let Some(offset) = first_mismatch {
        warn!("Image readback mismatch at {:x}.", offset);
        return Err(LoadError::ReadbackMismatch { offset });
    }
    Ok(())
}

/// Write and validate the image, retrying up to [UPLOAD_ATTEMPTS] times.
pub async fn upload_image<T: Transport>(
    transport: &mut T,
    image: &FirmwareImage<'_>,
    offset: u32,
) -> Result<(), LoadError> {
    for attempt in 1..=UPLOAD_ATTEMPTS {
        let res = write_image(transport, image, offset)
            .and_then(|_| validate_image(transport, image, offset));
        match res {
            Ok(()) => {
                debug!(
                    "Uploaded {} bytes to {:x} in attempt {}.",
                    image.size, offset, attempt
                );
                return Ok(());
            }
            Err(err) => warn!("Upload attempt {} failed: {:?}", attempt, err),
        }
        if attempt != UPLOAD_ATTEMPTS {
            transport.wait_ms(UPLOAD_RETRY_DELAY_MS).await;
        }
    }
    error!("Giving up on image upload after {} attempts.", UPLOAD_ATTEMPTS);
    Err(LoadError::FirmwareUploadFailed)
}

/// Soft reset the MAC and halt the eCPU.
pub async fn reset_and_halt<T: Transport>(transport: &mut T) {
    let soft_reset = transport.read16(Reg::SoftReset);
    transport.write16(Reg::SoftReset, soft_reset | SOFT_RESET_BIT);
    transport.flush();
    transport.wait_ms(10).await;
    transport.write16(Reg::SoftReset, soft_reset & !SOFT_RESET_BIT);
    transport.write16(Reg::EcpuCtrl, ECPU_CTRL_HALT);
    transport.flush();
}

/// Let the eCPU run the uploaded firmware.
pub fn start_ecpu<T: Transport>(transport: &mut T) {
    transport.write16(Reg::EcpuCtrl, ECPU_CTRL_RUN);
    transport.flush();
}

/// Wait for the firmware to signal, that it finished initialization.
pub async fn wait_for_init<T: Transport>(transport: &mut T) -> Result<(), LoadError> {
    let init_done = IrqStatus::new().with_fcs_threshold(true);
    for _ in 0..INIT_POLLS {
        let status = transport.read16(Reg::IrqStatusNonDes);
        if status == HW_ABSENT_16 {
            error!("Device vanished while waiting for firmware init.");
            return Err(LoadError::HardwareAbsent);
        }
        if IrqStatus::from_bits(status).fcs_threshold() {
            transport.write16(Reg::IrqAck, init_done.into_bits());
            return Ok(());
        }
        transport.wait_ms(INIT_POLL_INTERVAL_MS).await;
    }
    error!("Firmware didn't finish init.");
    Err(LoadError::InitTimeout)
}

/// Load the radio module into chip memory and tell the firmware about it.
///
/// Combined firmware builds have no separate radio image, which isn't an error.
pub async fn upload_radio<T: Transport>(
    port: &mut MailboxPort<'_, T>,
    image: Option<&FirmwareImage<'_>>,
) -> Result<(), LoadError> {
    let Some(image) = image else {
        debug!("No radio image, assuming combined firmware.");
        return Ok(());
    };
    let offset = MemoryMap::read(port).await?.code_end;
    let timeout_ms = port.timeout_ms();

    port.issue_cmd(CmdCode::Sleep, &mut [], 0, timeout_ms).await?;
    let uploaded = upload_image(port.transport, image, offset).await;
    // The firmware has to be woken up in any case. An upload error takes precedence.
    let woken = port.issue_cmd(CmdCode::Wake, &mut [], 0, timeout_ms).await;
    uploaded?;
    woken?;

    let mut params = [0u8; 8];
    params[0..4].copy_from_slice(&offset.to_le_bytes());
    params[4..8].copy_from_slice(&image.size.to_le_bytes());
    port.issue_cmd(CmdCode::RadioInit, &mut params, 8, timeout_ms)
        .await?;
    info!("Radio module loaded at {:x}.", offset);
    Ok(())
}

/// Assemble an image with a valid checksum from raw data.
#[cfg(test)]
pub fn build_image(data: &[u8]) -> alloc::vec::Vec<u8> {
    let size = data.len() as u32;
    let checksum = data
        .iter()
        .fold(byte_sum(size), |sum, byte| sum.wrapping_add(*byte as u32));
    let mut raw = alloc::vec::Vec::with_capacity(HEADER_LEN + data.len());
    raw.extend_from_slice(&checksum.to_le_bytes());
    raw.extend_from_slice(&size.to_le_bytes());
    raw.extend_from_slice(data);
    raw
}
