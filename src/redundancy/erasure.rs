//! Erasure coding primitive.
//!
//! The Reed-Solomon scheme delegates its arithmetic to this interface: a
//! systematic code over GF(2^8) with a Cauchy coefficient matrix, which is
//! maximum-distance-separable for any data/parity split with
//! `data + parity <= 255`.
//!
//! Codeword symbols are indexed `0..data` for the data symbols and
//! `data..data+parity` for the parity rows.

use anyhow::{bail, Error};
use lazy_static::lazy_static;

/// Byte-wise erasure coder over equal-length symbol slices.
pub trait ErasureCoder: Send + Sync {
    /// Compute parity row `row` over the `data` slices into `out`.
    fn encode_row(&self, data: &[&[u8]], row: usize, out: &mut [u8]);

    /// Reconstruct the `missing` codeword symbols from at least `data`
    /// surviving symbols given as (symbol index, slice).
    fn reconstruct(
        &self,
        data: usize,
        present: &[(usize, &[u8])],
        missing: &[usize],
    ) -> Result<Vec<Vec<u8>>, Error>;
}

const GF_POLY: u32 = 0x11d;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

lazy_static! {
    static ref TABLES: Tables = {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u32 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    };
}

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    debug_assert!(a != 0);
    let t = &*TABLES;
    t.exp[255 - t.log[a as usize] as usize]
}

/// Cauchy coefficient for parity row `row` and data column `col`.
fn coefficient(data: usize, row: usize, col: usize) -> u8 {
    // x_row = data + row and y_col = col are disjoint, so x ^ y != 0
    gf_inv(((data + row) as u8) ^ (col as u8))
}

/// GF(2^8) Cauchy-matrix coder.
pub struct Gf256Coder;

impl Gf256Coder {
    fn solve(
        matrix: &mut [Vec<u8>],
        rhs: &mut [Vec<u8>],
    ) -> Result<(), Error> {
        let n = matrix.len();
        for col in 0..n {
            // find a pivot
            let pivot = (col..n)
                .find(|&row| matrix[row][col] != 0)
                .ok_or_else(|| anyhow::format_err!("singular decode matrix"))?;
            matrix.swap(col, pivot);
            rhs.swap(col, pivot);

            let inv = gf_inv(matrix[col][col]);
            for value in matrix[col].iter_mut() {
                *value = gf_mul(*value, inv);
            }
            for value in rhs[col].iter_mut() {
                *value = gf_mul(*value, inv);
            }

            for row in 0..n {
                if row == col || matrix[row][col] == 0 {
                    continue;
                }
                let factor = matrix[row][col];
                for k in 0..n {
                    let scaled = gf_mul(factor, matrix[col][k]);
                    matrix[row][k] ^= scaled;
                }
                for k in 0..rhs[col].len() {
                    let scaled = gf_mul(factor, rhs[col][k]);
                    rhs[row][k] ^= scaled;
                }
            }
        }
        Ok(())
    }
}

impl ErasureCoder for Gf256Coder {
    fn encode_row(&self, data: &[&[u8]], row: usize, out: &mut [u8]) {
        out.fill(0);
        for (col, slice) in data.iter().enumerate() {
            let c = coefficient(data.len(), row, col);
            for (o, v) in out.iter_mut().zip(slice.iter()) {
                *o ^= gf_mul(c, *v);
            }
        }
    }

    fn reconstruct(
        &self,
        data: usize,
        present: &[(usize, &[u8])],
        missing: &[usize],
    ) -> Result<Vec<Vec<u8>>, Error> {
        if present.len() < data {
            bail!(
                "need {} surviving symbols to reconstruct, have {}",
                data,
                present.len()
            );
        }
        let width = present.first().map(|(_, s)| s.len()).unwrap_or(0);

        // equations for the data unknowns: identity rows for surviving data
        // symbols, Cauchy rows for surviving parity symbols
        let mut matrix = Vec::with_capacity(data);
        let mut rhs = Vec::with_capacity(data);
        let mut ordered: Vec<&(usize, &[u8])> = present.iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        for (index, slice) in ordered.into_iter().take(data) {
            let mut row = vec![0u8; data];
            if *index < data {
                row[*index] = 1;
            } else {
                for (col, value) in row.iter_mut().enumerate() {
                    *value = coefficient(data, *index - data, col);
                }
            }
            matrix.push(row);
            rhs.push(slice.to_vec());
        }

        Self::solve(&mut matrix, &mut rhs)?;
        // rhs now holds the data symbols in order

        let mut result = Vec::with_capacity(missing.len());
        for index in missing {
            if *index < data {
                result.push(rhs[*index].clone());
            } else {
                let slices: Vec<&[u8]> = rhs.iter().map(|s| s.as_slice()).collect();
                let mut out = vec![0u8; width];
                self.encode_row(&slices, *index - data, &mut out);
                result.push(out);
            }
        }
        Ok(result)
    }
}
