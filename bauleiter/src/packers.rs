//! Packing strategies: which units a project needs and how their outputs
//! become one firmware image.

use crate::error::{BuildError, BuildResult};
use crate::steps::{StartGate, StepExecutor};
use crate::unit::{BuildUnit, RO, RW, SINGLE_IMAGE, UnitVariant};
use async_trait::async_trait;
use convenient_process::{CommandSpec, LogSource, Severity};
use convenient_project::PackerKind;
use std::path::{Path, PathBuf};

/// Name of the packed image for the binary packers.
pub const IMAGE_NAME: &str = "ec.bin";

/// Where a unit's compiler output lands.
pub fn zephyr_output(unit: &BuildUnit, file: &str) -> PathBuf {
    unit.dir.join("zephyr").join(file)
}

/// Everything a packer may touch.
pub struct PackContext<'a> {
    /// Project name.
    pub project: &'a str,
    /// Units in variant order.
    pub units: &'a [BuildUnit],
    /// Destination directory (created by the caller).
    pub output_dir: &'a Path,
    /// For packers that run external tools.
    pub executor: &'a StepExecutor,
    /// Project log source.
    pub source: &'a mut LogSource,
    /// Project start gate.
    pub gate: &'a StartGate,
}

impl PackContext<'_> {
    fn error(&self, reason: impl Into<String>) -> BuildError {
        BuildError::Packing {
            project: self.project.to_string(),
            reason: reason.into(),
        }
    }

    fn unit(&self, name: &str) -> BuildResult<&BuildUnit> {
        self.units
            .iter()
            .find(|unit| unit.name == name)
            .ok_or_else(|| self.error(format!("missing unit `{name}`")))
    }

    fn read(&self, path: &Path) -> BuildResult<Vec<u8>> {
        std::fs::read(path).map_err(|e| self.error(format!("cannot read {}: {}", path.display(), e)))
    }

    fn write(&self, name: &str, content: &[u8]) -> BuildResult<PathBuf> {
        let path = self.output_dir.join(name);
        std::fs::write(&path, content)
            .map_err(|e| self.error(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

/// A packing strategy.
#[async_trait]
pub trait Packer: Send + Sync {
    /// Units this packer needs.
    fn variants(&self) -> &'static [UnitVariant];

    /// Combine unit outputs; returns the written artifact paths.
    async fn pack(&self, ctx: &mut PackContext<'_>) -> BuildResult<Vec<PathBuf>>;
}

/// Strategy for a descriptor's `packer` field.
pub fn packer_for(kind: PackerKind) -> Box<dyn Packer> {
    match kind {
        PackerKind::Elf => Box::new(ElfPacker),
        PackerKind::Raw => Box::new(RawPacker),
        PackerKind::Concat => Box::new(ConcatPacker),
        PackerKind::Binman => Box::new(BinmanPacker),
    }
}

/// Ships the ELF of a single image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfPacker;

#[async_trait]
impl Packer for ElfPacker {
    fn variants(&self) -> &'static [UnitVariant] {
        &[SINGLE_IMAGE]
    }

    async fn pack(&self, ctx: &mut PackContext<'_>) -> BuildResult<Vec<PathBuf>> {
        let unit = ctx.unit(SINGLE_IMAGE.name)?;
        let elf = ctx.read(&zephyr_output(unit, "zephyr.elf"))?;
        Ok(vec![ctx.write("zephyr.elf", &elf)?])
    }
}

/// Ships the raw binary of a single image.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPacker;

#[async_trait]
impl Packer for RawPacker {
    fn variants(&self) -> &'static [UnitVariant] {
        &[SINGLE_IMAGE]
    }

    async fn pack(&self, ctx: &mut PackContext<'_>) -> BuildResult<Vec<PathBuf>> {
        let unit = ctx.unit(SINGLE_IMAGE.name)?;
        let bin = ctx.read(&zephyr_output(unit, "zephyr.bin"))?;
        Ok(vec![ctx.write(IMAGE_NAME, &bin)?])
    }
}

/// RO image followed directly by the RW image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatPacker;

#[async_trait]
impl Packer for ConcatPacker {
    fn variants(&self) -> &'static [UnitVariant] {
        &[RO, RW]
    }

    async fn pack(&self, ctx: &mut PackContext<'_>) -> BuildResult<Vec<PathBuf>> {
        let mut image = ctx.read(&zephyr_output(ctx.unit(RO.name)?, "zephyr.bin"))?;
        let ro_size = image.len();
        image.extend(ctx.read(&zephyr_output(ctx.unit(RW.name)?, "zephyr.bin"))?);
        ctx.source.note(
            Severity::Info,
            format!("Packed {} bytes (RO {} + RW {})", image.len(), ro_size, image.len() - ro_size),
        );
        Ok(vec![ctx.write(IMAGE_NAME, &image)?])
    }
}

/// Lays out RO and RW with the external `binman` tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinmanPacker;

#[async_trait]
impl Packer for BinmanPacker {
    fn variants(&self) -> &'static [UnitVariant] {
        &[RO, RW]
    }

    async fn pack(&self, ctx: &mut PackContext<'_>) -> BuildResult<Vec<PathBuf>> {
        let ro = ctx.unit(RO.name)?;
        let rw = ctx.unit(RW.name)?;
        let work_dir = ctx.output_dir.join("binman");
        std::fs::create_dir_all(&work_dir)
            .map_err(|e| ctx.error(format!("cannot create {}: {}", work_dir.display(), e)))?;

        let argv = vec![
            ctx.executor.tools().resolve("binman"),
            "build".to_string(),
            "-a".to_string(),
            format!("image-ro={}", zephyr_output(ro, "zephyr.bin").display()),
            "-a".to_string(),
            format!("image-rw={}", zephyr_output(rw, "zephyr.bin").display()),
            "-d".to_string(),
            zephyr_output(ro, "zephyr.dtb").display().to_string(),
            "-m".to_string(),
            "-O".to_string(),
            work_dir.display().to_string(),
        ];
        let spec = CommandSpec::new(argv).current_dir(&work_dir);
        ctx.source.note(Severity::Info, format!("Packing: {}", spec.display()));

        ctx.executor
            .run(ctx.project, "binman", spec, ctx.source, ctx.gate)
            .await
            .map_err(|e| match e {
                cancelled @ BuildError::Cancelled { .. } => cancelled,
                other => ctx.error(other.to_string()),
            })?;

        let produced = work_dir.join(IMAGE_NAME);
        let target = ctx.output_dir.join(IMAGE_NAME);
        std::fs::rename(&produced, &target)
            .map_err(|e| ctx.error(format!("binman produced no {}: {}", IMAGE_NAME, e)))?;
        Ok(vec![target])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants() {
        assert_eq!(packer_for(PackerKind::Elf).variants(), &[SINGLE_IMAGE]);
        assert_eq!(packer_for(PackerKind::Raw).variants(), &[SINGLE_IMAGE]);
        assert_eq!(packer_for(PackerKind::Concat).variants(), &[RO, RW]);
        assert_eq!(packer_for(PackerKind::Binman).variants(), &[RO, RW]);
    }
}
