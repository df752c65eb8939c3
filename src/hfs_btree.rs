/*
 * BSD 2-Clause License
 *
 * Copyright (c) 2021, Khaled Emara
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 *    list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
 * DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
 * FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
 * SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
 * CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
 * OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */
use std::collections::HashSet;

use bincode::Decode;
use byteorder::{BigEndian, ByteOrder};

use super::error::{Error, Result};
use super::utils::decode_or_truncated;
use super::vfs::{read_exact_at, ReadAt};

/// HFS B-tree nodes are always 512 bytes.
pub const NODE_SIZE: u64 = 512;

/// A node cannot hold more records than this; larger counts mean a
/// corrupt node.
const MAX_RECORDS: u16 = 248;

mod node_type {
    pub const LEAF: u8 = 0xFF;
    pub const HEADER: u8 = 0x01;
}

#[derive(Clone, Copy, Debug, Decode)]
struct NodeDescriptor {
    nd_f_link: u32,
    _nd_b_link: u32,
    nd_type: u8,
    _nd_n_height: u8,
    nd_n_recs: u16,
    _nd_resv2: u16,
}

#[derive(Clone, Copy, Debug, Decode)]
struct HeaderRecord {
    _bth_depth: u16,
    _bth_root: u32,
    _bth_n_recs: u32,
    bth_f_node: u32,
    _bth_l_node: u32,
    bth_node_size: u16,
}

/// One leaf record, raw: length-prefixed key then value bytes.
pub type BRecord = Vec<u8>;

fn load_node(file: &dyn ReadAt, node: u32) -> Result<[u8; NODE_SIZE as usize]> {
    let mut buf = [0u8; NODE_SIZE as usize];
    read_exact_at(file, &mut buf, u64::from(node) * NODE_SIZE)?;
    Ok(buf)
}

fn records(node: &[u8; NODE_SIZE as usize], nrecs: u16) -> Result<Vec<BRecord>> {
    if nrecs > MAX_RECORDS {
        return Err(Error::BadHeader(format!("b-tree node with {nrecs} records")));
    }
    // The offset table grows inward from the node's end: entry i at
    // NODE_SIZE - 2*(i+1), with one extra entry marking free space.
    let mut out = Vec::with_capacity(usize::from(nrecs));
    for i in 0..usize::from(nrecs) {
        let lo = usize::from(BigEndian::read_u16(&node[510 - 2 * i..512 - 2 * i]));
        let hi = usize::from(BigEndian::read_u16(&node[508 - 2 * i..510 - 2 * i]));
        let table_floor = NODE_SIZE as usize - 2 * (usize::from(nrecs) + 1);
        if lo < 14 || hi <= lo || hi > table_floor {
            return Err(Error::BadHeader(format!(
                "b-tree record bounds {lo}..{hi}"
            )));
        }
        out.push(node[lo..hi].to_vec());
    }
    Ok(out)
}

/// Every leaf record of the tree, in key order.
///
/// The header node names the first leaf; leaves are chained by forward
/// links.  The chain must terminate, stay within the file, and never
/// revisit a node.
pub fn leaf_records(file: &dyn ReadAt, file_len: u64) -> Result<Vec<BRecord>> {
    let header = load_node(file, 0)?;
    let (desc, desc_len) = decode_or_truncated::<NodeDescriptor>(&header)?;
    if desc.nd_type != node_type::HEADER {
        return Err(Error::BadHeader(format!("node 0 type {}", desc.nd_type)));
    }
    let (hdr, _) = decode_or_truncated::<HeaderRecord>(&header[desc_len..])?;
    if u64::from(hdr.bth_node_size) != NODE_SIZE {
        return Err(Error::BadHeader(format!("node size {}", hdr.bth_node_size)));
    }

    let node_count = file_len / NODE_SIZE;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut node = hdr.bth_f_node;
    while node != 0 {
        if u64::from(node) >= node_count || !seen.insert(node) {
            return Err(Error::BadHeader(format!("b-tree leaf chain loops at {node}")));
        }
        let raw = load_node(file, node)?;
        let (desc, _) = decode_or_truncated::<NodeDescriptor>(&raw)?;
        if desc.nd_type != node_type::LEAF {
            return Err(Error::BadHeader(format!(
                "node {node} in leaf chain has type {}",
                desc.nd_type
            )));
        }
        out.extend(records(&raw, desc.nd_n_recs)?);
        node = desc.nd_f_link;
    }
    Ok(out)
}
