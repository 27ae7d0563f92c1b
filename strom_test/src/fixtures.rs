//! Small resources that are shared by the tests of several crates.

/// glTF document with a single triangle in the xy plane. Positions, normals and `u16` indices
/// are stored in an embedded base64 buffer so that the document can be imported from memory.
pub const TRIANGLE_GLTF: &str = r#"{
    "asset": { "version": "2.0" },
    "buffers": [
        {
            "byteLength": 80,
            "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAAAAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAAAAAAAAAAAAIA/AAABAAIAAAA="
        }
    ],
    "bufferViews": [
        { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
        { "buffer": 0, "byteOffset": 36, "byteLength": 36 },
        { "buffer": 0, "byteOffset": 72, "byteLength": 6 }
    ],
    "accessors": [
        { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0, 0, 0], "max": [1, 1, 0] },
        { "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC3" },
        { "bufferView": 2, "componentType": 5123, "count": 3, "type": "SCALAR" }
    ],
    "meshes": [
        {
            "name": "triangle",
            "primitives": [{ "attributes": { "POSITION": 0, "NORMAL": 1 }, "indices": 2 }]
        }
    ]
}"#;

/// Number of bytes of the triangle in the device layout of a model
/// (3 positions, 3 normals and 3 `u32` indices).
pub const TRIANGLE_DEVICE_SIZE: u64 = 3 * 12 + 3 * 12 + 3 * 4;
