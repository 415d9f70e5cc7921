//! Systematic Reed-Solomon codec over GF(256) for the PFT layer.
//!
//! The PFT code of TS 102 821 is RS(255, 207) with generator polynomial
//! 0x11d and first root α^1, virtually shortened to the chunk length. The
//! erasure decoder recovers lost fragments on the receive side and backs
//! the protection round-trip tests.

use once_cell::sync::Lazy;
use thiserror::Error;

const GF_POLY: u16 = 0x11D;
const FIELD: usize = 255;

/// Parity bytes appended to every chunk, fixed by TS 102 821.
pub const PARITY_BYTES: usize = 48;

/// First root of the generator polynomial.
const FIRST_ROOT: usize = 1;

struct GfTables {
    exp: [u8; 2 * FIELD],
    log: [u8; FIELD + 1],
}

static TABLES: Lazy<GfTables> = Lazy::new(|| {
    let mut exp = [0u8; 2 * FIELD];
    let mut log = [0u8; FIELD + 1];

    let mut x: u16 = 1;
    for i in 0..FIELD {
        exp[i] = x as u8;
        exp[i + FIELD] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
    }
    GfTables { exp, log }
});

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_inv(a: u8) -> u8 {
    let t = &*TABLES;
    t.exp[FIELD - t.log[a as usize] as usize]
}

/// α^e for 0 <= e < 255·255.
fn gf_pow(e: usize) -> u8 {
    TABLES.exp[e % FIELD]
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RsError {
    #[error("invalid Reed-Solomon parameters N={n} K={k}")]
    InvalidParameters { n: usize, k: usize },

    #[error("data length {got} does not match K={k}")]
    BadDataLength { got: usize, k: usize },

    #[error("codeword length {got} does not match N={n}")]
    BadCodewordLength { got: usize, n: usize },

    #[error("{0} erasures exceed the correction capacity")]
    TooManyErasures(usize),

    #[error("erasure position {0} out of range")]
    BadErasurePosition(usize),

    #[error("codeword is not correctable")]
    Uncorrectable,
}

pub struct ReedSolomon {
    n: usize,
    k: usize,
    /// Generator polynomial coefficients, `gen[j]` is the coefficient of
    /// x^j; monic of degree n-k.
    gen: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(n: usize, k: usize) -> Result<Self, RsError> {
        if n > FIELD || k == 0 || k >= n {
            return Err(RsError::InvalidParameters { n, k });
        }
        let nroots = n - k;

        // g(x) = (x + α^1)(x + α^2)...(x + α^nroots)
        let mut gen = vec![0u8; nroots + 1];
        gen[0] = 1;
        for i in 0..nroots {
            let root = gf_pow(FIRST_ROOT + i);
            let mut next = vec![0u8; nroots + 1];
            for j in (0..=i).rev() {
                next[j + 1] ^= gen[j];
                next[j] ^= gf_mul(gen[j], root);
            }
            for j in 0..=i + 1 {
                gen[j] = next[j];
            }
        }

        Ok(ReedSolomon { n, k, gen })
    }

    pub fn nroots(&self) -> usize {
        self.n - self.k
    }

    /// Compute the parity bytes for exactly K data bytes.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, RsError> {
        if data.len() != self.k {
            return Err(RsError::BadDataLength {
                got: data.len(),
                k: self.k,
            });
        }

        let nroots = self.nroots();
        let mut parity = vec![0u8; nroots];

        for &d in data {
            let feedback = d ^ parity[0];
            for j in 1..nroots {
                parity[j - 1] = parity[j] ^ gf_mul(feedback, self.gen[nroots - j]);
            }
            parity[nroots - 1] = gf_mul(feedback, self.gen[0]);
        }

        Ok(parity)
    }

    fn syndromes(&self, codeword: &[u8]) -> Vec<u8> {
        let nroots = self.nroots();
        let mut syndromes = vec![0u8; nroots];
        for (j, syndrome) in syndromes.iter_mut().enumerate() {
            // S_j = c(α^(fcr+j))
            let root = gf_pow(FIRST_ROOT + j);
            let mut acc = 0u8;
            for &c in codeword {
                acc = gf_mul(acc, root) ^ c;
            }
            *syndrome = acc;
        }
        syndromes
    }

    /// Recover a codeword whose bytes at `erasures` were lost. The caller
    /// zeroes the erased positions; positions index the N-byte codeword.
    pub fn decode_erasures(
        &self,
        codeword: &mut [u8],
        erasures: &[usize],
    ) -> Result<(), RsError> {
        if codeword.len() != self.n {
            return Err(RsError::BadCodewordLength {
                got: codeword.len(),
                n: self.n,
            });
        }
        let t = erasures.len();
        if t > self.nroots() {
            return Err(RsError::TooManyErasures(t));
        }
        for &pos in erasures {
            if pos >= self.n {
                return Err(RsError::BadErasurePosition(pos));
            }
        }

        let syndromes = self.syndromes(codeword);
        if syndromes.iter().all(|&s| s == 0) {
            return Ok(());
        }
        if t == 0 {
            return Err(RsError::Uncorrectable);
        }

        // Solve sum_l E_l · α^((fcr+j)·p_l) = S_j for the erasure values,
        // where p_l is the power of the erased position. A t×t linear
        // system; Gaussian elimination over GF(256).
        let powers: Vec<usize> = erasures.iter().map(|&pos| self.n - 1 - pos).collect();
        let mut matrix = vec![vec![0u8; t + 1]; t];
        for j in 0..t {
            for (l, &p) in powers.iter().enumerate() {
                matrix[j][l] = gf_pow((FIRST_ROOT + j) * p);
            }
            matrix[j][t] = syndromes[j];
        }

        for col in 0..t {
            let pivot_row = (col..t)
                .find(|&r| matrix[r][col] != 0)
                .ok_or(RsError::Uncorrectable)?;
            matrix.swap(col, pivot_row);

            let inv = gf_inv(matrix[col][col]);
            for x in matrix[col].iter_mut() {
                *x = gf_mul(*x, inv);
            }

            for row in 0..t {
                if row != col && matrix[row][col] != 0 {
                    let factor = matrix[row][col];
                    for x in 0..=t {
                        let sub = gf_mul(factor, matrix[col][x]);
                        matrix[row][x] ^= sub;
                    }
                }
            }
        }

        for (l, &pos) in erasures.iter().enumerate() {
            codeword[pos] ^= matrix[l][t];
        }

        let check = self.syndromes(codeword);
        if check.iter().any(|&s| s != 0) {
            return Err(RsError::Uncorrectable);
        }
        Ok(())
    }
}
