//! Binary checkpoint files for the primal-dual state.
//!
//! The layout is fixed and little-endian:
//!
//! ```text
//!   [i32 total_vars] [i32 total_wcon] [i32 ncon]
//!   [f64 barrier_param]
//!   [f64 z[ncon]] [f64 s[ncon]]
//!   [f64 x[total_vars]] [f64 zl[total_vars]] [f64 zu[total_vars]]
//!   [f64 zw[total_wcon]] [f64 sw[total_wcon]]
//! ```
//!
//! The root rank writes the header and the replicated dense-constraint
//! data; every rank writes its owned slice of the distributed vectors at
//! the offset given by its ownership range. Reading is strict: a size
//! mismatch fails without mutating any solver state.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use faer::Col;

use crate::comm::{Communicator, OPT_ROOT};
use crate::ipm::InteriorPoint;
use crate::E;

const HEADER_LEN: u64 = 3 * 4 + 8;

fn write_scalars(file: &mut File, vals: impl Iterator<Item = E>) -> io::Result<()> {
    for v in vals {
        file.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_scalars(file: &mut File, n: usize) -> io::Result<Vec<E>> {
    let mut buf = [0u8; 8];
    let mut vals = Vec::with_capacity(n);
    for _ in 0..n {
        file.read_exact(&mut buf)?;
        vals.push(E::from_le_bytes(buf));
    }
    Ok(vals)
}

fn col_iter(col: &Col<E>) -> impl Iterator<Item = E> + '_ {
    (0..col.nrows()).map(move |i| col[i])
}

impl<'a> InteriorPoint<'a> {
    /// Writes the primal-dual state to a checkpoint file.
    pub fn write_solution_file(&self, path: &Path) -> io::Result<()> {
        let total_vars = *self.var_range.last().unwrap();
        let total_wcon = *self.wcon_range.last().unwrap();
        let ncon = self.flags.ncon;
        let rank = self.comm.rank();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        if rank == OPT_ROOT {
            file.write_all(&(total_vars as i32).to_le_bytes())?;
            file.write_all(&(total_wcon as i32).to_le_bytes())?;
            file.write_all(&(ncon as i32).to_le_bytes())?;
            file.write_all(&self.barrier_param.to_le_bytes())?;
            write_scalars(&mut file, col_iter(&self.vars.z))?;
            write_scalars(&mut file, col_iter(&self.vars.s))?;
        }

        // Distributed vectors land at this rank's offset within each block
        let mut offset = HEADER_LEN + (2 * ncon) as u64 * 8;
        let var_off = self.var_range[rank] as u64 * 8;
        let wcon_off = self.wcon_range[rank] as u64 * 8;

        for col in [&self.vars.x, &self.vars.zl, &self.vars.zu] {
            file.seek(SeekFrom::Start(offset + var_off))?;
            write_scalars(&mut file, col_iter(col))?;
            offset += total_vars as u64 * 8;
        }

        if total_wcon > 0 {
            for col in [&self.vars.zw, &self.vars.sw] {
                file.seek(SeekFrom::Start(offset + wcon_off))?;
                write_scalars(&mut file, col_iter(col))?;
                offset += total_wcon as u64 * 8;
            }
        }

        Ok(())
    }

    /// Reads the primal-dual state from a checkpoint file written by
    /// [`write_solution_file`](Self::write_solution_file).
    ///
    /// The stored problem sizes must match this instance exactly; on a
    /// mismatch the call fails and no solver state is modified.
    pub fn read_solution_file(&mut self, path: &Path) -> io::Result<()> {
        let total_vars = *self.var_range.last().unwrap();
        let total_wcon = *self.wcon_range.last().unwrap();
        let ncon = self.flags.ncon;
        let rank = self.comm.rank();

        let mut file = File::open(path)?;

        let mut ibuf = [0u8; 4];
        let mut sizes = [0i32; 3];
        for s in sizes.iter_mut() {
            file.read_exact(&mut ibuf)?;
            *s = i32::from_le_bytes(ibuf);
        }
        if sizes[0] != total_vars as i32
            || sizes[1] != total_wcon as i32
            || sizes[2] != ncon as i32
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "problem size incompatible with solution file",
            ));
        }

        let mut fbuf = [0u8; 8];
        file.read_exact(&mut fbuf)?;
        let barrier_param = E::from_le_bytes(fbuf);

        let z = read_scalars(&mut file, ncon)?;
        let s = read_scalars(&mut file, ncon)?;

        let mut offset = HEADER_LEN + (2 * ncon) as u64 * 8;
        let var_off = self.var_range[rank] as u64 * 8;
        let wcon_off = self.wcon_range[rank] as u64 * 8;
        let nvars = self.flags.nvars;
        let nwcon = self.flags.nwcon;

        let mut dist = Vec::new();
        for _ in 0..3 {
            file.seek(SeekFrom::Start(offset + var_off))?;
            dist.push(read_scalars(&mut file, nvars)?);
            offset += total_vars as u64 * 8;
        }
        let mut wdist = Vec::new();
        if total_wcon > 0 {
            for _ in 0..2 {
                file.seek(SeekFrom::Start(offset + wcon_off))?;
                wdist.push(read_scalars(&mut file, nwcon)?);
                offset += total_wcon as u64 * 8;
            }
        }

        // Everything was read successfully; commit the state
        self.barrier_param = barrier_param;
        for i in 0..ncon {
            self.vars.z[i] = z[i];
            self.vars.s[i] = s[i];
        }
        for i in 0..nvars {
            self.vars.x[i] = dist[0][i];
            self.vars.zl[i] = dist[1][i];
            self.vars.zu[i] = dist[2][i];
        }
        if total_wcon > 0 {
            for i in 0..nwcon {
                self.vars.zw[i] = wdist[0][i];
                self.vars.sw[i] = wdist[1][i];
            }
        }

        Ok(())
    }
}
