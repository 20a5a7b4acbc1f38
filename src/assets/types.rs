//! Typed descriptors produced by the asset database.

use std::collections::HashMap;

use crate::error::Error;

pub use crate::device::ShaderStage;

/// Stable identifier of an asset inside one database.
pub type AssetId = i64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AssetType {
    Shader,
    Texture,
    Mesh,
    Material,
}

pub fn asset_type_from_str(value: &str) -> Result<AssetType, Error> {
    match value {
        "shader" => Ok(AssetType::Shader),
        "texture" => Ok(AssetType::Texture),
        "mesh" => Ok(AssetType::Mesh),
        "material" => Ok(AssetType::Material),
        _ => Err(Error::SchemaError),
    }
}

pub fn shader_stage_from_str(value: &str) -> Result<ShaderStage, Error> {
    match value {
        "vertex" => Ok(ShaderStage::Vertex),
        "fragment" => Ok(ShaderStage::Fragment),
        _ => Err(Error::SchemaError),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    Srgb,
    Linear,
}

pub fn color_space_from_str(value: &str) -> Result<ColorSpace, Error> {
    match value {
        "srgb" => Ok(ColorSpace::Srgb),
        "linear" => Ok(ColorSpace::Linear),
        _ => Err(Error::SchemaError),
    }
}

/// Sampler presets a material may reference by name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerType {
    LinearWrap,
    LinearClamp,
    NearestWrap,
    ShadowCompare,
}

pub fn sampler_type_from_str(value: &str) -> Result<SamplerType, Error> {
    match value {
        "linear_wrap" => Ok(SamplerType::LinearWrap),
        "linear_clamp" => Ok(SamplerType::LinearClamp),
        "nearest_wrap" => Ok(SamplerType::NearestWrap),
        "shadow_compare" => Ok(SamplerType::ShadowCompare),
        _ => Err(Error::SchemaError),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderStageDescriptor {
    pub spirv_path: String,
    pub meta_path: String,
}

/// A shader asset: one SPIR-V module per declared pipeline stage.
#[derive(Clone, Debug, Default)]
pub struct ShaderDescriptor {
    pub stages: HashMap<ShaderStage, ShaderStageDescriptor>,
}

#[derive(Clone, Debug)]
pub struct TextureDescriptor {
    pub image_path: String,
    pub color_space: ColorSpace,
    pub mipmaps: bool,
}

#[derive(Clone, Debug)]
pub struct SubmeshDescriptor {
    pub name: String,
    pub first_index: u32,
    pub index_count: u32,
    pub material: AssetId,
}

#[derive(Clone, Debug)]
pub struct MeshDescriptor {
    pub source: String,
    pub submeshes: Vec<SubmeshDescriptor>,
}

#[derive(Clone, Debug)]
pub struct MaterialTextureDescriptor {
    pub name: String,
    pub asset: AssetId,
    pub sampler: SamplerType,
}

#[derive(Clone, Debug)]
pub struct MaterialParameterDescriptor {
    pub name: String,
    pub value: f64,
}

#[derive(Clone, Debug, Default)]
pub struct MaterialDescriptor {
    pub textures: Vec<MaterialTextureDescriptor>,
    pub parameters: Vec<MaterialParameterDescriptor>,
}

/// Variant payload of one asset database entry.
#[derive(Clone, Debug)]
pub enum AssetData {
    Shader(ShaderDescriptor),
    Texture(TextureDescriptor),
    Mesh(MeshDescriptor),
    Material(MaterialDescriptor),
}

/// One parsed and validated asset database entry.
///
/// Descriptors are frozen once the database has loaded, they are shared and
/// never mutated afterwards.
#[derive(Clone, Debug)]
pub struct AssetDescriptor {
    pub id: AssetId,
    pub data: AssetData,
}

impl AssetDescriptor {
    pub fn asset_type(&self) -> AssetType {
        match &self.data {
            AssetData::Shader(_) => AssetType::Shader,
            AssetData::Texture(_) => AssetType::Texture,
            AssetData::Mesh(_) => AssetType::Mesh,
            AssetData::Material(_) => AssetType::Material,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_spellings() {
        assert_eq!(asset_type_from_str("shader").unwrap(), AssetType::Shader);
        assert_eq!(asset_type_from_str("material").unwrap(), AssetType::Material);
        assert_eq!(asset_type_from_str("Shader").unwrap_err(), Error::SchemaError);

        assert_eq!(shader_stage_from_str("vertex").unwrap(), ShaderStage::Vertex);
        assert_eq!(shader_stage_from_str("compute").unwrap_err(), Error::SchemaError);

        assert_eq!(sampler_type_from_str("shadow_compare").unwrap(), SamplerType::ShadowCompare);
        assert_eq!(sampler_type_from_str("trilinear").unwrap_err(), Error::SchemaError);
    }
}
