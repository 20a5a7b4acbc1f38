//! Loads and validates the asset database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::assets::types::*;
use crate::error::Error;
use crate::scheduler::Scheduler;

const ASSET_ID_PARAMETER: &str = "id";
const ASSET_TYPE_PARAMETER: &str = "type";

const SHADER_STAGES_PARAMETER: &str = "stages";
const SHADER_STAGE_SPIRV_PARAMETER: &str = "spirv";
const SHADER_STAGE_META_PARAMETER: &str = "meta";
const SHADER_STAGE_TYPE_PARAMETER: &str = "type";

const TEXTURE_IMAGE_PARAMETER: &str = "image";
const TEXTURE_COLOUR_SPACE_PARAMETER: &str = "colour_space";
const TEXTURE_MIPMAPS_PARAMETER: &str = "mipmaps";

const MESH_SOURCE_PARAMETER: &str = "source";
const MESH_SUBMESHES_PARAMETER: &str = "submeshes";
const SUBMESH_NAME_PARAMETER: &str = "name";
const SUBMESH_FIRST_INDEX_PARAMETER: &str = "first_index";
const SUBMESH_INDEX_COUNT_PARAMETER: &str = "index_count";
const SUBMESH_MATERIAL_PARAMETER: &str = "material";

const MATERIAL_TEXTURES_PARAMETER: &str = "textures";
const MATERIAL_PARAMETERS_PARAMETER: &str = "parameters";
const MATERIAL_TEXTURE_NAME_PARAMETER: &str = "name";
const MATERIAL_TEXTURE_ASSET_PARAMETER: &str = "asset";
const MATERIAL_TEXTURE_SAMPLER_PARAMETER: &str = "sampler";
const MATERIAL_PARAMETER_NAME_PARAMETER: &str = "name";
const MATERIAL_PARAMETER_VALUE_PARAMETER: &str = "value";

/// Field kinds the generic validator can check for.
#[derive(Copy, Clone, Debug)]
enum ExpectedKind {
    String,
    Integer,
    Boolean,
    List,
}

struct RequiredParameter {
    name: &'static str,
    kind: ExpectedKind,
}

const ASSET_REQUIRED_PARAMETERS: [RequiredParameter; 2] = [
    RequiredParameter { name: ASSET_ID_PARAMETER, kind: ExpectedKind::Integer },
    RequiredParameter { name: ASSET_TYPE_PARAMETER, kind: ExpectedKind::String },
];

const SHADER_REQUIRED_PARAMETERS: [RequiredParameter; 1] = [
    RequiredParameter { name: SHADER_STAGES_PARAMETER, kind: ExpectedKind::List },
];

const SHADER_STAGE_REQUIRED_PARAMETERS: [RequiredParameter; 3] = [
    RequiredParameter { name: SHADER_STAGE_SPIRV_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: SHADER_STAGE_META_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: SHADER_STAGE_TYPE_PARAMETER, kind: ExpectedKind::String },
];

const TEXTURE_REQUIRED_PARAMETERS: [RequiredParameter; 3] = [
    RequiredParameter { name: TEXTURE_IMAGE_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: TEXTURE_COLOUR_SPACE_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: TEXTURE_MIPMAPS_PARAMETER, kind: ExpectedKind::Boolean },
];

const MESH_REQUIRED_PARAMETERS: [RequiredParameter; 2] = [
    RequiredParameter { name: MESH_SOURCE_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: MESH_SUBMESHES_PARAMETER, kind: ExpectedKind::List },
];

const SUBMESH_REQUIRED_PARAMETERS: [RequiredParameter; 4] = [
    RequiredParameter { name: SUBMESH_NAME_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: SUBMESH_FIRST_INDEX_PARAMETER, kind: ExpectedKind::Integer },
    RequiredParameter { name: SUBMESH_INDEX_COUNT_PARAMETER, kind: ExpectedKind::Integer },
    RequiredParameter { name: SUBMESH_MATERIAL_PARAMETER, kind: ExpectedKind::Integer },
];

const MATERIAL_REQUIRED_PARAMETERS: [RequiredParameter; 2] = [
    RequiredParameter { name: MATERIAL_TEXTURES_PARAMETER, kind: ExpectedKind::List },
    RequiredParameter { name: MATERIAL_PARAMETERS_PARAMETER, kind: ExpectedKind::List },
];

const MATERIAL_TEXTURE_REQUIRED_PARAMETERS: [RequiredParameter; 3] = [
    RequiredParameter { name: MATERIAL_TEXTURE_NAME_PARAMETER, kind: ExpectedKind::String },
    RequiredParameter { name: MATERIAL_TEXTURE_ASSET_PARAMETER, kind: ExpectedKind::Integer },
    RequiredParameter { name: MATERIAL_TEXTURE_SAMPLER_PARAMETER, kind: ExpectedKind::String },
];

/// Parses the declarative asset database and answers descriptor lookups.
///
/// The manager has no strand lanes of its own. Its state is written exactly
/// once during [`AssetManager::initialize`] and is immutable afterwards, so
/// lookups are safe from any lane.
pub struct AssetManager {
    assets: Mutex<HashMap<AssetId, Arc<AssetDescriptor>>>,
}

impl AssetManager {
    /// Default location of the asset database.
    pub const DATABASE_PATH: &'static str = "resources/assetsdb.json";

    pub fn new() -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the database from [`AssetManager::DATABASE_PATH`].
    pub async fn initialize(&self, scheduler: &Scheduler) -> Result<(), Error> {
        self.initialize_from(scheduler, Path::new(Self::DATABASE_PATH)).await
    }

    /// Loads the database from an explicit path.
    ///
    /// Fails with [`Error::SchemaError`] on any malformed entry (missing
    /// field, wrong field kind, unknown enum spelling, duplicate id) and
    /// with [`Error::InternalError`] on I/O failure or a non array root.
    /// On failure no partial state is published.
    pub async fn initialize_from(&self, scheduler: &Scheduler, path: &Path) -> Result<(), Error> {
        log::trace!("initializing asset manager from {:?}", path);

        let data = scheduler.read_file(path).await.map_err(|err| {
            log::error!("asset manager failed to load assets db: {}", err);
            Error::InternalError
        })?;

        let root: Value = serde_json::from_slice(&data).map_err(|err| {
            log::error!("asset database is not valid json: {}", err);
            Error::InternalError
        })?;

        let array = root.as_array().ok_or_else(|| {
            log::error!("asset database root is not an array");
            Error::InternalError
        })?;

        let mut assets = HashMap::new();

        for item in array {
            let asset = match item.as_object() {
                Some(asset) => asset,
                None => continue,
            };

            validate_required_parameters(asset, &ASSET_REQUIRED_PARAMETERS)?;

            let asset_id = asset[ASSET_ID_PARAMETER].as_i64().unwrap();
            let asset_type = asset_type_from_str(asset[ASSET_TYPE_PARAMETER].as_str().unwrap())
                .map_err(|err| {
                    log::error!("asset {} has invalid type", asset_id);
                    err
                })?;

            if assets.contains_key(&asset_id) {
                log::error!("duplicate asset id {}", asset_id);
                return Err(Error::SchemaError);
            }

            let data = match asset_type {
                AssetType::Shader => AssetData::Shader(parse_shader_descriptor(asset)?),
                AssetType::Texture => AssetData::Texture(parse_texture_descriptor(asset)?),
                AssetType::Mesh => AssetData::Mesh(parse_mesh_descriptor(asset)?),
                AssetType::Material => AssetData::Material(parse_material_descriptor(asset)?),
            };

            assets.insert(asset_id, Arc::new(AssetDescriptor {
                id: asset_id,
                data,
            }));
        }

        log::debug!("asset manager loaded {} assets", assets.len());
        *self.assets.lock() = assets;

        Ok(())
    }

    /// Looks up the descriptor of an asset.
    pub fn get_asset(&self, asset_id: AssetId) -> Result<Arc<AssetDescriptor>, Error> {
        self.assets.lock().get(&asset_id).cloned().ok_or(Error::NotFoundError)
    }
}

impl Default for AssetManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that every required field is present with the expected kind.
/// Unknown fields are ignored.
fn validate_required_parameters(
    object: &Map<String, Value>,
    parameters: &[RequiredParameter],
) -> Result<(), Error> {
    for parameter in parameters {
        let value = object.get(parameter.name).ok_or_else(|| {
            log::error!("asset entry is missing required field {}", parameter.name);
            Error::SchemaError
        })?;

        let matches = match parameter.kind {
            ExpectedKind::String => value.is_string(),
            ExpectedKind::Integer => value.is_i64(),
            ExpectedKind::Boolean => value.is_boolean(),
            ExpectedKind::List => value.is_array(),
        };

        if !matches {
            log::error!(
                "asset entry field {} has the wrong kind, expected {:?}",
                parameter.name, parameter.kind
            );
            return Err(Error::SchemaError);
        }
    }

    Ok(())
}

fn parse_shader_descriptor(asset: &Map<String, Value>) -> Result<ShaderDescriptor, Error> {
    validate_required_parameters(asset, &SHADER_REQUIRED_PARAMETERS)?;

    let mut descriptor = ShaderDescriptor::default();

    for item in asset[SHADER_STAGES_PARAMETER].as_array().unwrap() {
        let stage_object = item.as_object().ok_or_else(|| {
            log::error!("shader stage entry is not an object");
            Error::SchemaError
        })?;

        validate_required_parameters(stage_object, &SHADER_STAGE_REQUIRED_PARAMETERS)?;

        let stage = shader_stage_from_str(
            stage_object[SHADER_STAGE_TYPE_PARAMETER].as_str().unwrap()
        )?;

        descriptor.stages.entry(stage).or_insert_with(|| ShaderStageDescriptor {
            spirv_path: stage_object[SHADER_STAGE_SPIRV_PARAMETER].as_str().unwrap().to_string(),
            meta_path: stage_object[SHADER_STAGE_META_PARAMETER].as_str().unwrap().to_string(),
        });
    }

    Ok(descriptor)
}

fn parse_texture_descriptor(asset: &Map<String, Value>) -> Result<TextureDescriptor, Error> {
    validate_required_parameters(asset, &TEXTURE_REQUIRED_PARAMETERS)?;

    Ok(TextureDescriptor {
        image_path: asset[TEXTURE_IMAGE_PARAMETER].as_str().unwrap().to_string(),
        color_space: color_space_from_str(
            asset[TEXTURE_COLOUR_SPACE_PARAMETER].as_str().unwrap()
        )?,
        mipmaps: asset[TEXTURE_MIPMAPS_PARAMETER].as_bool().unwrap(),
    })
}

fn parse_index_u32(value: &Value) -> Result<u32, Error> {
    u32::try_from(value.as_i64().unwrap()).map_err(|_| {
        log::error!("mesh index value {} is out of range", value);
        Error::SchemaError
    })
}

fn parse_mesh_descriptor(asset: &Map<String, Value>) -> Result<MeshDescriptor, Error> {
    validate_required_parameters(asset, &MESH_REQUIRED_PARAMETERS)?;

    let mut submeshes = Vec::new();
    for item in asset[MESH_SUBMESHES_PARAMETER].as_array().unwrap() {
        let submesh = item.as_object().ok_or_else(|| {
            log::error!("submesh entry is not an object");
            Error::SchemaError
        })?;

        validate_required_parameters(submesh, &SUBMESH_REQUIRED_PARAMETERS)?;

        submeshes.push(SubmeshDescriptor {
            name: submesh[SUBMESH_NAME_PARAMETER].as_str().unwrap().to_string(),
            first_index: parse_index_u32(&submesh[SUBMESH_FIRST_INDEX_PARAMETER])?,
            index_count: parse_index_u32(&submesh[SUBMESH_INDEX_COUNT_PARAMETER])?,
            material: submesh[SUBMESH_MATERIAL_PARAMETER].as_i64().unwrap(),
        });
    }

    Ok(MeshDescriptor {
        source: asset[MESH_SOURCE_PARAMETER].as_str().unwrap().to_string(),
        submeshes,
    })
}

fn parse_material_descriptor(asset: &Map<String, Value>) -> Result<MaterialDescriptor, Error> {
    validate_required_parameters(asset, &MATERIAL_REQUIRED_PARAMETERS)?;

    let mut descriptor = MaterialDescriptor::default();

    for item in asset[MATERIAL_TEXTURES_PARAMETER].as_array().unwrap() {
        let texture = item.as_object().ok_or_else(|| {
            log::error!("material texture entry is not an object");
            Error::SchemaError
        })?;

        validate_required_parameters(texture, &MATERIAL_TEXTURE_REQUIRED_PARAMETERS)?;

        descriptor.textures.push(MaterialTextureDescriptor {
            name: texture[MATERIAL_TEXTURE_NAME_PARAMETER].as_str().unwrap().to_string(),
            asset: texture[MATERIAL_TEXTURE_ASSET_PARAMETER].as_i64().unwrap(),
            sampler: sampler_type_from_str(
                texture[MATERIAL_TEXTURE_SAMPLER_PARAMETER].as_str().unwrap()
            )?,
        });
    }

    for item in asset[MATERIAL_PARAMETERS_PARAMETER].as_array().unwrap() {
        let parameter = item.as_object().ok_or_else(|| {
            log::error!("material parameter entry is not an object");
            Error::SchemaError
        })?;

        let name = parameter.get(MATERIAL_PARAMETER_NAME_PARAMETER)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                log::error!("material parameter entry has no name");
                Error::SchemaError
            })?;
        let value = parameter.get(MATERIAL_PARAMETER_VALUE_PARAMETER)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                log::error!("material parameter {} has no numeric value", name);
                Error::SchemaError
            })?;

        descriptor.parameters.push(MaterialParameterDescriptor {
            name: name.to_string(),
            value,
        });
    }

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use futures::executor::block_on;

    use super::*;

    fn write_db(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ember-core-assetdb-{}-{}.json", name, std::process::id()));

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();

        path
    }

    fn initialize(name: &str, contents: &str) -> (AssetManager, Result<(), Error>) {
        let scheduler = Scheduler::new(2).unwrap();
        let manager = AssetManager::new();
        let path = write_db(name, contents);

        let result = block_on(manager.initialize_from(&scheduler, &path));
        std::fs::remove_file(&path).unwrap();

        (manager, result)
    }

    const FULL_DB: &str = r#"[
        {
            "id": 1,
            "type": "shader",
            "stages": [
                { "spirv": "shaders/solid.vert.spv", "meta": "shaders/solid.vert.json", "type": "vertex" },
                { "spirv": "shaders/solid.frag.spv", "meta": "shaders/solid.frag.json", "type": "fragment" }
            ]
        },
        {
            "id": 2,
            "type": "texture",
            "image": "textures/bricks.png",
            "colour_space": "srgb",
            "mipmaps": true
        },
        {
            "id": 3,
            "type": "mesh",
            "source": "meshes/room.bin",
            "submeshes": [
                { "name": "walls", "first_index": 0, "index_count": 720, "material": 4 }
            ]
        },
        {
            "id": 4,
            "type": "material",
            "textures": [
                { "name": "albedo", "asset": 2, "sampler": "linear_wrap" }
            ],
            "parameters": [
                { "name": "roughness", "value": 0.5 }
            ]
        }
    ]"#;

    #[test]
    fn loads_all_asset_types() {
        let (manager, result) = initialize("full", FULL_DB);
        result.unwrap();

        let shader = manager.get_asset(1).unwrap();
        match &shader.data {
            AssetData::Shader(descriptor) => {
                assert_eq!(descriptor.stages.len(), 2);
                assert_eq!(
                    descriptor.stages[&ShaderStage::Vertex].spirv_path,
                    "shaders/solid.vert.spv"
                );
            }
            other => panic!("expected shader, got {:?}", other),
        }

        let texture = manager.get_asset(2).unwrap();
        match &texture.data {
            AssetData::Texture(descriptor) => {
                assert_eq!(descriptor.color_space, ColorSpace::Srgb);
                assert!(descriptor.mipmaps);
            }
            other => panic!("expected texture, got {:?}", other),
        }

        let mesh = manager.get_asset(3).unwrap();
        match &mesh.data {
            AssetData::Mesh(descriptor) => {
                assert_eq!(descriptor.submeshes.len(), 1);
                assert_eq!(descriptor.submeshes[0].index_count, 720);
            }
            other => panic!("expected mesh, got {:?}", other),
        }

        let material = manager.get_asset(4).unwrap();
        match &material.data {
            AssetData::Material(descriptor) => {
                assert_eq!(descriptor.textures[0].sampler, SamplerType::LinearWrap);
                assert_eq!(descriptor.parameters[0].value, 0.5);
            }
            other => panic!("expected material, got {:?}", other),
        }

        assert_eq!(manager.get_asset(99).unwrap_err(), Error::NotFoundError);
    }

    #[test]
    fn duplicate_id_is_schema_error() {
        let db = r#"[
            { "id": 42, "type": "texture", "image": "a.png", "colour_space": "srgb", "mipmaps": false },
            { "id": 42, "type": "texture", "image": "b.png", "colour_space": "srgb", "mipmaps": false }
        ]"#;

        let (manager, result) = initialize("dup", db);
        assert_eq!(result.unwrap_err(), Error::SchemaError);

        // No partial state may leak out of a failed load.
        assert_eq!(manager.get_asset(42).unwrap_err(), Error::NotFoundError);
    }

    #[test]
    fn missing_mipmaps_is_schema_error() {
        let db = r#"[
            { "id": 7, "type": "texture", "image": "a.png", "colour_space": "srgb" }
        ]"#;

        let (_, result) = initialize("missing-field", db);
        assert_eq!(result.unwrap_err(), Error::SchemaError);
    }

    #[test]
    fn wrong_kind_is_schema_error() {
        let db = r#"[
            { "id": 7, "type": "texture", "image": "a.png", "colour_space": "srgb", "mipmaps": "yes" }
        ]"#;

        let (_, result) = initialize("wrong-kind", db);
        assert_eq!(result.unwrap_err(), Error::SchemaError);
    }

    #[test]
    fn unknown_enum_spelling_is_schema_error() {
        let db = r#"[
            {
                "id": 1,
                "type": "shader",
                "stages": [
                    { "spirv": "s.spv", "meta": "s.json", "type": "geometry" }
                ]
            }
        ]"#;

        let (_, result) = initialize("bad-stage", db);
        assert_eq!(result.unwrap_err(), Error::SchemaError);
    }

    #[test]
    fn non_array_root_is_internal_error() {
        let (_, result) = initialize("bad-root", r#"{ "id": 1 }"#);
        assert_eq!(result.unwrap_err(), Error::InternalError);
    }

    #[test]
    fn missing_file_is_internal_error() {
        let scheduler = Scheduler::new(2).unwrap();
        let manager = AssetManager::new();

        let result = block_on(manager.initialize_from(
            &scheduler,
            Path::new("/nonexistent/ember-core-assets.json"),
        ));
        assert_eq!(result.unwrap_err(), Error::InternalError);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let db = r#"[
            {
                "id": 9,
                "type": "texture",
                "image": "a.png",
                "colour_space": "linear",
                "mipmaps": false,
                "editor_note": "ignored",
                "lod_bias": 3
            }
        ]"#;

        let (manager, result) = initialize("extra-fields", db);
        result.unwrap();
        assert_eq!(manager.get_asset(9).unwrap().asset_type(), AssetType::Texture);
    }
}
