//! Synthetic NCA images for the integration tests.

#![allow(dead_code)]

use ncakit::crypto::aes::{ctr_xor, ecb_encrypt};
use ncakit::crypto::{AesIv128, AesKey128, XtsCipher, sha256};
use ncakit::keys::KeySet;

pub const HEADER_KEY: [u8; 32] = [
    0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87, 0x98, 0xa9, 0xba, 0xcb, 0xdc, 0xed, 0xfe, 0x0f,
    0x01, 0x12, 0x23, 0x34, 0x45, 0x56, 0x67, 0x78, 0x89, 0x9a, 0xab, 0xbc, 0xcd, 0xde, 0xef, 0xf0,
];
pub const KAEK: AesKey128 = AesKey128([0x5a; 16]);
pub const TITLEKEK: AesKey128 = AesKey128([0x6b; 16]);
pub const BODY_KEY: AesKey128 = AesKey128([0x37; 16]);
pub const UPPER_IV: u64 = 0x0000_0002_0000_0000;

const EMPTY: u32 = u32::MAX;

/// Key set that opens everything [`NcaBuilder`] produces by default.
pub fn keyset() -> KeySet {
    let mut keys = KeySet::new();
    keys.header_key = Some(HEADER_KEY);
    keys.kaek[0][0] = Some(KAEK);
    keys.titlekek[0] = Some(TITLEKEK);
    keys
}

pub fn align(v: usize, a: usize) -> usize {
    v.div_ceil(a) * a
}

/// One section: its plaintext FS header and its plaintext body.
pub struct Section {
    pub fs_header: Vec<u8>,
    pub body: Vec<u8>,
    /// Section-relative ranges left unencrypted in a CTR section.
    pub plain_ranges: Vec<(usize, usize)>,
}

impl Section {
    fn encryption(&self) -> u8 {
        self.fs_header[4]
    }
}

pub struct NcaBuilder {
    pub magic: [u8; 4],
    pub rights_id: [u8; 16],
    pub key_area_index: u8,
    pub sections: Vec<Section>,
    /// Replace the stored FS header hash of a section.
    pub bad_fs_hash: Option<usize>,
}

impl NcaBuilder {
    pub fn new(sections: Vec<Section>) -> Self {
        Self {
            magic: *b"NCA3",
            rights_id: [0; 16],
            key_area_index: 0,
            sections,
            bad_fs_hash: None,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut header = vec![0u8; 0xC00];
        header[0x200..0x204].copy_from_slice(&self.magic);
        header[0x207] = self.key_area_index;
        header[0x230..0x240].copy_from_slice(&self.rights_id);
        header[0x300 + 0x20..0x300 + 0x30].copy_from_slice(&ecb_encrypt(&KAEK, BODY_KEY.as_bytes()));

        let mut body = Vec::new();
        for (i, section) in self.sections.iter().enumerate() {
            let start = 0xC00 + body.len();
            let mut data = section.body.clone();
            data.resize(align(data.len().max(1), 0x200), 0);

            if matches!(section.encryption(), 3 | 5) {
                let upper = u64::from_le_bytes(section.fs_header[0x140..0x148].try_into().unwrap());
                let mut enc = data.clone();
                ctr_xor(&BODY_KEY, &AesIv128::from_upper_iv(upper, start as u64), &mut enc);
                for &(s, e) in &section.plain_ranges {
                    enc[s..e].copy_from_slice(&data[s..e]);
                }
                data = enc;
            }

            let end = start + data.len();
            let entry = 0x240 + i * 0x10;
            header[entry..entry + 4].copy_from_slice(&((start / 0x200) as u32).to_le_bytes());
            header[entry + 4..entry + 8].copy_from_slice(&((end / 0x200) as u32).to_le_bytes());

            let mut hash = sha256(&section.fs_header);
            if self.bad_fs_hash == Some(i) {
                hash[0] ^= 1;
            }
            header[0x280 + i * 0x20..0x2A0 + i * 0x20].copy_from_slice(&hash);
            header[0x400 + i * 0x200..0x600 + i * 0x200].copy_from_slice(&section.fs_header);
            body.extend_from_slice(&data);
        }

        let xts = XtsCipher::new(&HEADER_KEY);
        xts.encrypt(&mut header[..0x400], 0, 0x200).unwrap();
        if &self.magic == b"NCA2" {
            for sector in header[0x400..].chunks_exact_mut(0x200) {
                xts.encrypt(sector, 0, 0x200).unwrap();
            }
        } else {
            xts.encrypt(&mut header[0x400..], 2, 0x200).unwrap();
        }

        header.extend_from_slice(&body);
        header
    }
}

fn fs_header(fs_type: u8, hash_type: u8, encryption: u8, upper_iv: u64) -> Vec<u8> {
    let mut h = vec![0u8; 0x200];
    h[0..2].copy_from_slice(&2u16.to_le_bytes());
    h[2] = fs_type;
    h[3] = hash_type;
    h[4] = encryption;
    h[0x140..0x148].copy_from_slice(&upper_iv.to_le_bytes());
    h
}

/// HierarchicalSha256 section over `data`: hash table at 0, data at 0x200.
pub fn sha256_section(data: &[u8], block_size: usize, encryption: u8) -> Section {
    let table: Vec<u8> = data.chunks(block_size).flat_map(sha256).collect();
    assert!(table.len() <= 0x200);
    let mut body = vec![0u8; 0x200];
    body[..table.len()].copy_from_slice(&table);
    body.extend_from_slice(data);

    let mut h = fs_header(1, 2, encryption, UPPER_IV);
    let d = &mut h[0x08..];
    d[..0x20].copy_from_slice(&sha256(&table));
    d[0x20..0x24].copy_from_slice(&(block_size as u32).to_le_bytes());
    d[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
    d[0x30..0x38].copy_from_slice(&(table.len() as u64).to_le_bytes());
    d[0x38..0x40].copy_from_slice(&0x200u64.to_le_bytes());
    d[0x40..0x48].copy_from_slice(&(data.len() as u64).to_le_bytes());

    let plain_ranges = if encryption == 5 {
        vec![(0, table.len())]
    } else {
        Vec::new()
    };
    Section {
        fs_header: h,
        body,
        plain_ranges,
    }
}

fn padded_hashes(data: &[u8], bs: usize) -> Vec<u8> {
    data.chunks(bs)
        .flat_map(|c| {
            let mut b = c.to_vec();
            b.resize(bs, 0);
            sha256(&b)
        })
        .collect()
}

/// Two-level IVFC section over `data` with 0x200-byte blocks.
pub fn integrity_section(data: &[u8], encryption: u8) -> Section {
    const BS: usize = 0x200;
    let level1 = padded_hashes(data, BS);
    let level0 = padded_hashes(&level1, BS);
    assert!(level0.len() <= BS);
    let master = padded_hashes(&level0, BS);

    let l1_off = BS;
    let data_off = l1_off + align(level1.len(), BS);
    let mut body = vec![0u8; data_off];
    body[..level0.len()].copy_from_slice(&level0);
    body[l1_off..l1_off + level1.len()].copy_from_slice(&level1);
    body.extend_from_slice(data);

    let mut h = fs_header(0, 3, encryption, UPPER_IV);
    let d = &mut h[0x08..];
    d[..4].copy_from_slice(b"IVFC");
    d[4..8].copy_from_slice(&0x20000u32.to_le_bytes());
    d[8..12].copy_from_slice(&0x20u32.to_le_bytes());
    d[12..16].copy_from_slice(&4u32.to_le_bytes());
    let levels = [
        (0usize, level0.len()),
        (l1_off, level1.len()),
        (data_off, data.len()),
    ];
    for (i, (off, size)) in levels.into_iter().enumerate() {
        let l = &mut d[0x10 + i * 0x18..];
        l[..8].copy_from_slice(&(off as u64).to_le_bytes());
        l[8..16].copy_from_slice(&(size as u64).to_le_bytes());
        l[16..20].copy_from_slice(&9u32.to_le_bytes());
    }
    d[0xC0..0xE0].copy_from_slice(&master);

    Section {
        fs_header: h,
        body,
        plain_ranges: Vec::new(),
    }
}

/// Store `section`'s body through a compression table: the first
/// `stored` bytes as-is, the rest as a single LZ4 block.
pub fn compress_section(mut section: Section, stored: usize) -> Section {
    let logical = section.body;
    let packed = lz4_flex::block::compress(&logical[stored..]);

    let mut physical = logical[..stored].to_vec();
    physical.extend_from_slice(&packed);
    let table_offset = align(physical.len(), 0x10);
    physical.resize(table_offset, 0);

    const NODE: usize = 0x4000;
    let mut table = vec![0u8; NODE * 2];
    table[4..8].copy_from_slice(&1u32.to_le_bytes());
    table[8..16].copy_from_slice(&(logical.len() as u64).to_le_bytes());
    let set = &mut table[NODE..];
    set[4..8].copy_from_slice(&2u32.to_le_bytes());
    set[8..16].copy_from_slice(&(logical.len() as u64).to_le_bytes());
    let entries = [
        (0u64, 0u64, 0u8, stored as u32),
        (stored as u64, stored as u64, 3, packed.len() as u32),
    ];
    for (i, (virt, phys, kind, size)) in entries.into_iter().enumerate() {
        let e = &mut set[0x10 + i * 0x18..];
        e[..8].copy_from_slice(&virt.to_le_bytes());
        e[8..16].copy_from_slice(&phys.to_le_bytes());
        e[16] = kind;
        e[20..24].copy_from_slice(&size.to_le_bytes());
    }
    physical.extend_from_slice(&table);

    let h = &mut section.fs_header;
    h[0x178..0x180].copy_from_slice(&(table_offset as u64).to_le_bytes());
    h[0x180..0x188].copy_from_slice(&(table.len() as u64).to_le_bytes());
    h[0x188..0x18C].copy_from_slice(b"BKTR");
    h[0x18C..0x190].copy_from_slice(&1u32.to_le_bytes());
    h[0x190..0x194].copy_from_slice(&2u32.to_le_bytes());

    section.body = physical;
    section
}

pub fn pfs0_image(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut strings = Vec::new();
    let mut entries = Vec::new();
    let mut data = Vec::new();
    for (name, contents) in files {
        entries.push((data.len() as u64, contents.len() as u64, strings.len() as u32));
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);
        data.extend_from_slice(contents);
    }
    strings.resize(align(strings.len(), 0x10), 0);

    let mut out = Vec::new();
    out.extend_from_slice(b"PFS0");
    out.extend_from_slice(&(files.len() as u32).to_le_bytes());
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    for (offset, size, name) in entries {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&name.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
    }
    out.extend_from_slice(&strings);
    out.extend_from_slice(&data);
    out
}

fn romfs_entry(links: &[u32], data: &[u64], name: &str) -> Vec<u8> {
    let mut e = Vec::new();
    for (i, v) in links.iter().enumerate() {
        e.extend_from_slice(&v.to_le_bytes());
        // File entries carry offset and size after parent and sibling.
        if i == 1 {
            for d in data {
                e.extend_from_slice(&d.to_le_bytes());
            }
        }
    }
    e.extend_from_slice(&(name.len() as u32).to_le_bytes());
    e.extend_from_slice(name.as_bytes());
    e.resize(align(e.len(), 4), 0);
    e
}

/// RomFS holding `hello.txt` and `sub/deep.bin`.
pub fn romfs_image(hello: &[u8], deep: &[u8]) -> Vec<u8> {
    let sub_off = 0x18u32;
    let root = romfs_entry(&[EMPTY, EMPTY, sub_off, 0, EMPTY], &[], "");
    let hello_entry = romfs_entry(&[0, EMPTY, EMPTY], &[0, hello.len() as u64], "hello.txt");
    let deep_off = hello_entry.len() as u32;
    let deep_data = align(hello.len(), 0x10) as u64;
    let deep_entry = romfs_entry(&[sub_off, EMPTY, EMPTY], &[deep_data, deep.len() as u64], "deep.bin");
    let sub = romfs_entry(&[0, EMPTY, EMPTY, deep_off, EMPTY], &[], "sub");
    assert_eq!(root.len(), sub_off as usize);

    let dirs = [root, sub].concat();
    let files = [hello_entry, deep_entry].concat();
    let dirs_off = 0x50u64;
    let files_off = dirs_off + dirs.len() as u64;
    let data_off = align((files_off as usize) + files.len(), 0x10) as u64;

    let mut image = Vec::new();
    for v in [
        0x50,
        dirs_off,
        0,
        dirs_off,
        dirs.len() as u64,
        files_off,
        0,
        files_off,
        files.len() as u64,
        data_off,
    ] {
        image.extend_from_slice(&v.to_le_bytes());
    }
    image.extend_from_slice(&dirs);
    image.extend_from_slice(&files);
    image.resize(data_off as usize, 0);
    image.extend_from_slice(hello);
    image.resize(data_off as usize + deep_data as usize, 0);
    image.extend_from_slice(deep);
    image
}
