//! VRC7 instrument ROM.
//!
//! The chip carries 15 fixed 2-operator patches; slot 0 is the user patch
//! assembled from registers $00–$07. Byte layout per patch:
//! AM/VIB/EG/KSR/MULT (modulator), same (carrier), KSL+TL, KSL+waveforms+FB,
//! AR/DR (modulator), AR/DR (carrier), SL/RR (modulator), SL/RR (carrier).

/// Built-in patches 1–15, as dumped from the hardware's patch ROM.
pub const VRC7_PATCHES: [[u8; 8]; 15] = [
    [0x03, 0x21, 0x05, 0x06, 0xE8, 0x81, 0x42, 0x27],
    [0x13, 0x41, 0x14, 0x0D, 0xD8, 0xF6, 0x23, 0x12],
    [0x11, 0x11, 0x08, 0x08, 0xFA, 0xB2, 0x20, 0x12],
    [0x31, 0x61, 0x0C, 0x07, 0xA8, 0x64, 0x61, 0x27],
    [0x32, 0x21, 0x1E, 0x06, 0xE1, 0x76, 0x01, 0x28],
    [0x02, 0x01, 0x06, 0x00, 0xA3, 0xE2, 0xF4, 0xF4],
    [0x21, 0x61, 0x1D, 0x07, 0x82, 0x81, 0x11, 0x07],
    [0x23, 0x21, 0x22, 0x17, 0xA2, 0x72, 0x01, 0x17],
    [0x35, 0x11, 0x25, 0x00, 0x40, 0x73, 0x72, 0x01],
    [0xB5, 0x01, 0x0F, 0x0F, 0xA8, 0xA5, 0x51, 0x02],
    [0x17, 0xC1, 0x24, 0x07, 0xF8, 0xF8, 0x22, 0x12],
    [0x71, 0x23, 0x11, 0x06, 0x65, 0x74, 0x18, 0x16],
    [0x01, 0x02, 0xD3, 0x05, 0xC9, 0x95, 0x03, 0x02],
    [0x61, 0x63, 0x0C, 0x00, 0x94, 0xC0, 0x33, 0xF6],
    [0x21, 0x72, 0x0D, 0x00, 0xC1, 0xD5, 0x56, 0x06],
];

/// Full 16-slot table (user patch zeroed) in register-file order.
pub fn default_patch_table() -> [[u8; 8]; 16] {
    let mut table = [[0u8; 8]; 16];
    table[1..16].copy_from_slice(&VRC7_PATCHES);
    table
}
